//! Client side of a plain connection.
//!
//! A [`Connection`] owns at most one live TCP link at a time. The link's
//! write half sits behind an async mutex (the "transport lock") so that
//! `send`, `connect`, and `disconnect` never interleave; the read half is
//! owned by a single receive task spawned on connect.
//!
//! ```text
//! Disconnected ──connect()──→ Connected ──disconnect()──→ Disconnected
//!                                 │
//!                                 └──read failure──→ on_connection_lost() ──→ Disconnected
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use futures_util::SinkExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use troupe_protocol::{Message, now_millis};
use troupe_transport::{
    FrameSink, FrameStream, TransportError, read_frame, write_frame,
};

use crate::{ClientHandler, ConnectionConfig, TroupeError};

/// The live half of a connection.
struct Link {
    sink: FrameSink,
    /// Stops the receive task without reporting a lost connection. A child
    /// of the connection's `lifetime`.
    stop: CancellationToken,
    /// Which `connect()` produced this link.
    epoch: u64,
}

struct Shared<H> {
    handler: H,
    link: Mutex<Option<Link>>,
    connected: AtomicBool,
    epoch: AtomicU64,
    /// Server clock minus local clock, in milliseconds.
    clock_offset_ms: AtomicI64,
}

/// A client connection to a troupe server.
///
/// Messages from the server go to the [`ClientHandler`]; messages to the
/// server go through [`send`](Self::send). There is no automatic
/// reconnection: after a lost connection call [`connect`](Self::connect)
/// again.
pub struct Connection<H: ClientHandler> {
    addr: String,
    config: ConnectionConfig,
    shared: Arc<Shared<H>>,
    /// Cancelled on drop; stops every receive task this connection spawned.
    lifetime: CancellationToken,
}

impl<H: ClientHandler> Connection<H> {
    /// Creates a disconnected connection to `addr` with default settings.
    pub fn new(addr: impl Into<String>, handler: H) -> Self {
        Self::with_config(addr, ConnectionConfig::default(), handler)
    }

    /// Creates a disconnected connection to `addr`.
    pub fn with_config(
        addr: impl Into<String>,
        config: ConnectionConfig,
        handler: H,
    ) -> Self {
        Self {
            addr: addr.into(),
            config,
            shared: Arc::new(Shared {
                handler,
                link: Mutex::new(None),
                connected: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                clock_offset_ms: AtomicI64::new(0),
            }),
            lifetime: CancellationToken::new(),
        }
    }

    /// The server address this connection dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The handler receiving this connection's messages.
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// `true` between a successful `connect` and the next disconnect or
    /// connection loss.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Best estimate of the server's clock, in Unix milliseconds.
    ///
    /// Derived from the timestamp of the most recent inbound message; equal
    /// to the local clock until something has been received.
    pub fn server_time_ms(&self) -> i64 {
        now_millis() + self.shared.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Opens the connection and starts the receive task.
    ///
    /// Does nothing if already connected.
    ///
    /// # Errors
    /// `TroupeError::Transport` if the server can't be reached within
    /// `connect_timeout`.
    pub async fn connect(&self) -> Result<(), TroupeError> {
        let mut link = self.shared.link.lock().await;
        if link.is_some() {
            return Ok(());
        }

        let (sink, stream) = troupe_transport::connect(
            &self.addr,
            self.config.connect_timeout,
            self.config.framing(),
        )
        .await?;

        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = self.lifetime.child_token();
        self.shared.connected.store(true, Ordering::Release);
        tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            stream,
            stop.clone(),
            epoch,
        ));
        *link = Some(Link { sink, stop, epoch });

        tracing::info!(addr = %self.addr, "connected");
        Ok(())
    }

    /// Sends one message and flushes it.
    ///
    /// # Errors
    /// - `EmptyMessage` if the message has no payload
    /// - `NotConnected` if there is no live connection
    /// - `Transport` if the write fails
    pub async fn send(&self, message: Message) -> Result<(), TroupeError> {
        self.shared.send(message).await
    }

    /// Closes the connection. Idempotent.
    ///
    /// Safe to call from the handler itself; the receive task stops
    /// without calling `on_connection_lost`.
    pub async fn disconnect(&self) {
        let link = self.shared.link.lock().await.take();
        self.shared.connected.store(false, Ordering::Release);
        if let Some(mut link) = link {
            link.stop.cancel();
            if let Err(e) = link.sink.close().await {
                tracing::debug!(addr = %self.addr, error = %e, "error closing connection");
            }
            tracing::info!(addr = %self.addr, "disconnected");
        }
    }
}

impl<H: ClientHandler> Drop for Connection<H> {
    fn drop(&mut self) {
        // The receive task keeps the shared state, and with it the socket,
        // alive until it stops.
        self.lifetime.cancel();
        self.shared.connected.store(false, Ordering::Release);
    }
}

impl<H: ClientHandler> Shared<H> {
    async fn send(&self, message: Message) -> Result<(), TroupeError> {
        if message.is_empty() {
            return Err(TroupeError::EmptyMessage);
        }
        let mut link = self.link.lock().await;
        let link = link.as_mut().ok_or(TroupeError::NotConnected)?;
        tracing::debug!(bytes = message.size(), "sending");
        write_frame(&mut link.sink, message.to_frame()).await?;
        Ok(())
    }

    /// Forgets the link created by `epoch`, if it is still current.
    ///
    /// Returns `false` when a newer `connect()` or a `disconnect()` already
    /// replaced it.
    async fn release(&self, epoch: u64) -> bool {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| l.epoch == epoch) {
            link.take();
            self.connected.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }
}

async fn receive_loop<H: ClientHandler>(
    shared: Arc<Shared<H>>,
    mut stream: FrameStream,
    stop: CancellationToken,
    epoch: u64,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return,
            frame = read_frame(&mut stream) => frame,
        };
        let message = match frame {
            Ok(Some(frame)) => match Message::from_frame(frame) {
                Ok(message) => message,
                Err(e) => break e.to_string(),
            },
            Ok(None) => {
                break TransportError::ConnectionClosed("closed by server".into()).to_string();
            }
            Err(e) => break e.to_string(),
        };

        shared
            .clock_offset_ms
            .store(message.timestamp() - now_millis(), Ordering::Relaxed);
        tracing::debug!(bytes = message.size(), "received");

        if let Some(answer) = shared.handler.on_receive(message).await {
            if let Err(e) = shared.send(answer).await {
                tracing::debug!(error = %e, "follow-up not sent");
            }
        }
    };

    if stop.is_cancelled() || !shared.release(epoch).await {
        return;
    }
    tracing::info!(%reason, "connection lost");
    shared.handler.on_connection_lost(&reason);
}
