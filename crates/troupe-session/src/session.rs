//! Session types: the server's record of one connected client.
//!
//! A session tracks:
//! - WHO the client is (`ClientId`, peer address)
//! - WHEN it was last heard from (for idle eviction)
//! - WHETHER it is still active
//! - WHAT is waiting to be written to it (the outbound queue)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use troupe_protocol::{ClientId, Message};

use crate::SessionError;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Idle-eviction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// A session with no inbound traffic for this long is evicted.
    ///
    /// Default: 1 hour.
    pub idle_timeout: Duration,

    /// How often the reaper scans for idle sessions. Eviction can lag the
    /// timeout by up to one interval.
    ///
    /// Default: 10 seconds.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One connected client.
///
/// Created on accept after the server handler approved the connection.
/// Shared (`Arc`) between the registry, the receiver task, and the sender
/// task. Any of them may [`close`](Self::close) it; closing is idempotent
/// and wakes whichever task is waiting on [`closed`](Self::closed).
#[derive(Debug)]
pub struct Session {
    id: ClientId,
    peer_addr: SocketAddr,
    born: Instant,
    /// Milliseconds after `born` of the last inbound message.
    last_activity_ms: AtomicU64,
    active: AtomicBool,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl Session {
    /// Creates a session together with the receiving end of its queue.
    ///
    /// The caller hands the [`OutboundQueue`] to the task that writes to the
    /// socket.
    pub fn new(id: ClientId, peer_addr: SocketAddr) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            peer_addr,
            born: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            active: AtomicBool::new(true),
            outbound: tx,
            closed: CancellationToken::new(),
        };
        (session, OutboundQueue { rx })
    }

    /// The client's id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// The remote address the client connected from.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Records inbound activity now.
    pub fn touch(&self) {
        let elapsed = self.born.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound message (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last)
    }

    /// `true` until the session is closed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queues `message` for the sender task.
    ///
    /// Success means "enqueued", not "written". Many callers may enqueue
    /// concurrently; the single sender task preserves enqueue order.
    pub fn try_send(&self, message: Message) -> Result<(), SessionError> {
        if message.is_empty() {
            return Err(SessionError::EmptyMessage(self.id.clone()));
        }
        if !self.is_active() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.outbound
            .send(message)
            .map_err(|_| SessionError::Closed(self.id.clone()))
    }

    /// Like [`try_send`](Self::try_send), reporting only success.
    pub fn send(&self, message: Message) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(client_id = %self.id, error = %e, "send dropped");
                false
            }
        }
    }

    /// Marks the session inactive and wakes its tasks.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::debug!(client_id = %self.id, "session closing");
        }
        self.closed.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

/// Receiving end of a session's outbound queue.
///
/// Unbounded: producers are never slowed down by a slow socket.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl OutboundQueue {
    /// Waits until at least one message is queued, then moves everything
    /// currently queued into `batch`.
    ///
    /// Returns `false` once every sender handle is gone and the queue is
    /// empty.
    pub async fn next_batch(&mut self, batch: &mut Vec<Message>) -> bool {
        match self.rx.recv().await {
            Some(first) => batch.push(first),
            None => return false,
        }
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        true
    }

    /// `true` if nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
