//! The session registry: every live session, keyed by client id.
//!
//! The registry is touched from many tasks at once: the accept loop
//! inserts, every session's teardown removes, and broadcasts and the
//! reaper iterate. It is built on a `DashMap` so none of those need an
//! outer lock, and iteration always works on a snapshot so that no map
//! shard stays locked while a message is being queued.
//!
//! ## Lifecycle
//!
//! ```text
//! accept ──→ insert() ──→ [registered] ──→ remove() / disconnect() / evict_idle()
//!                              │
//!                 send() / broadcast() / route()
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use troupe_protocol::{ClientId, Message, Recipient, ServerResponse};

use crate::{Session, SessionError};

/// Registry of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. A previous session under the same id is closed
    /// and returned.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id().clone();
        let previous = self.sessions.insert(id.clone(), session);
        if let Some(old) = &previous {
            tracing::warn!(client_id = %id, "replacing live session with the same id");
            old.close();
        }
        tracing::info!(client_id = %id, sessions = self.sessions.len(), "session registered");
        previous
    }

    /// Looks up a session.
    pub fn get(&self, id: &ClientId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes `session` if it is still the one registered under its id.
    ///
    /// Returns `true` if this call removed it. Comparing by identity keeps a
    /// late teardown from evicting a newer session that reused the id.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            tracing::info!(client_id = %session.id(), "session unregistered");
        }
        removed
    }

    /// Closes and unregisters the session for `id`.
    ///
    /// Returns `false` if there was no such session.
    pub fn disconnect(&self, id: &ClientId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close();
                tracing::info!(client_id = %id, "session disconnected");
                true
            }
            None => false,
        }
    }

    /// Closes and unregisters every session idle for at least `timeout`.
    ///
    /// Returns the evicted ids.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<ClientId> {
        let mut evicted = Vec::new();
        for session in self.snapshot() {
            if session.idle_for() >= timeout && self.remove(&session) {
                tracing::info!(
                    client_id = %session.id(),
                    idle = ?session.idle_for(),
                    "time is out for idle session"
                );
                session.close();
                evicted.push(session.id().clone());
            }
        }
        evicted
    }

    /// Closes and unregisters every session.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            self.remove(&session);
            session.close();
        }
    }

    /// Queues `message` for one client.
    pub fn try_send(&self, id: &ClientId, message: Message) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        session.try_send(message)
    }

    /// Queues `message` for one client, reporting only success.
    pub fn send(&self, id: &ClientId, message: Message) -> bool {
        tracing::debug!(client_id = %id, bytes = message.size(), "sending to client");
        match self.try_send(id, message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "unicast failed");
                false
            }
        }
    }

    /// Queues `message` for every registered session.
    ///
    /// Every session is attempted even after a failure; the result is the
    /// logical AND of the individual outcomes. Nothing is retried and
    /// nothing already queued is taken back.
    pub fn broadcast(&self, message: &Message) -> bool {
        let mut delivered = true;
        for session in self.snapshot() {
            delivered &= session.send(message.clone());
        }
        delivered
    }

    /// Delivers a handler's response for a request received from `from`.
    ///
    /// - no message → nothing to do (`true`)
    /// - [`Recipient::Sender`] → `from` only
    /// - [`Recipient::Client`] → that client only
    /// - [`Recipient::Broadcast`] → every registered session
    pub fn route(&self, from: &ClientId, response: &ServerResponse) -> bool {
        let Some(message) = response.message() else {
            return true;
        };
        match response.recipient() {
            Recipient::Sender => self.send(from, message.clone()),
            Recipient::Client(target) => self.send(target, message.clone()),
            Recipient::Broadcast => self.broadcast(message),
        }
    }

    /// Ids of every registered session.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutboundQueue;

    // -- Helpers ----------------------------------------------------------

    fn cid(id: &str) -> ClientId {
        ClientId::new(id)
    }

    /// Registers a session and returns it with its queue.
    fn add(registry: &SessionRegistry, id: &str) -> (Arc<Session>, OutboundQueue) {
        let (session, queue) = Session::new(cid(id), "127.0.0.1:9000".parse().unwrap());
        let session = Arc::new(session);
        registry.insert(Arc::clone(&session));
        (session, queue)
    }

    async fn drain(queue: &mut OutboundQueue) -> Vec<String> {
        let mut batch = Vec::new();
        queue.next_batch(&mut batch).await;
        batch
            .iter()
            .map(|m| m.as_text().unwrap_or_default().to_string())
            .collect()
    }

    fn is_idle(queue: &mut OutboundQueue) -> bool {
        queue.is_empty()
    }

    // =====================================================================
    // insert() / remove()
    // =====================================================================

    #[test]
    fn test_insert_and_get() {
        let registry = SessionRegistry::new();
        let (s, _q) = add(&registry, "a");
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&cid("a")).unwrap(), &s));
    }

    #[test]
    fn test_insert_same_id_closes_previous() {
        let registry = SessionRegistry::new();
        let (old, _q1) = add(&registry, "a");
        let (_new, _q2) = add(&registry, "a");
        assert!(!old.is_active());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_ignores_replaced_session() {
        let registry = SessionRegistry::new();
        let (old, _q1) = add(&registry, "a");
        let (new, _q2) = add(&registry, "a");

        // The old session's teardown must not unregister the new one.
        assert!(!registry.remove(&old));
        assert!(Arc::ptr_eq(&registry.get(&cid("a")).unwrap(), &new));

        assert!(registry.remove(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_closes_and_unregisters() {
        let registry = SessionRegistry::new();
        let (s, _q) = add(&registry, "a");
        assert!(registry.disconnect(&cid("a")));
        assert!(!s.is_active());
        assert!(registry.get(&cid("a")).is_none());
        assert!(!registry.disconnect(&cid("a")));
    }

    // =====================================================================
    // send() / broadcast()
    // =====================================================================

    #[test]
    fn test_send_to_unknown_client_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.try_send(&cid("ghost"), Message::from_text("x")),
            Err(SessionError::NotFound(_))
        ));
        assert!(!registry.send(&cid("ghost"), Message::from_text("x")));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (_s1, mut q1) = add(&registry, "one");
        let (_s2, mut q2) = add(&registry, "two");
        let (_s3, mut q3) = add(&registry, "three");

        assert!(registry.broadcast(&Message::from_text("hello all")));

        assert_eq!(drain(&mut q1).await, vec!["hello all"]);
        assert_eq!(drain(&mut q2).await, vec!["hello all"]);
        assert_eq!(drain(&mut q3).await, vec!["hello all"]);
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure_still_delivers_to_others() {
        let registry = SessionRegistry::new();
        let (_s1, mut q1) = add(&registry, "one");
        let (s2, _q2) = add(&registry, "two");
        let (_s3, mut q3) = add(&registry, "three");

        // Session two's socket is gone: closed but not yet unregistered.
        s2.close();

        assert!(!registry.broadcast(&Message::from_text("news")));

        assert_eq!(drain(&mut q1).await, vec!["news"]);
        assert_eq!(drain(&mut q3).await, vec!["news"]);
    }

    // =====================================================================
    // route()
    // =====================================================================

    #[tokio::test]
    async fn test_route_reply_goes_only_to_sender() {
        let registry = SessionRegistry::new();
        let (_a, mut qa) = add(&registry, "a");
        let (_b, mut qb) = add(&registry, "b");

        let resp = ServerResponse::reply(Message::from_text("for a"));
        assert!(registry.route(&cid("a"), &resp));

        assert_eq!(drain(&mut qa).await, vec!["for a"]);
        assert!(is_idle(&mut qb));
    }

    #[tokio::test]
    async fn test_route_targeted_goes_only_to_target() {
        let registry = SessionRegistry::new();
        let (_a, mut qa) = add(&registry, "a");
        let (_b, mut qb) = add(&registry, "b");
        let (_c, mut qc) = add(&registry, "c");

        let resp = ServerResponse::to(cid("c"), Message::from_text("for c"));
        assert!(registry.route(&cid("a"), &resp));

        assert_eq!(drain(&mut qc).await, vec!["for c"]);
        assert!(is_idle(&mut qa));
        assert!(is_idle(&mut qb));
    }

    #[test]
    fn test_route_nothing_sends_nothing() {
        let registry = SessionRegistry::new();
        let (a, mut qa) = add(&registry, "a");

        assert!(registry.route(&cid("a"), &ServerResponse::nothing()));
        assert!(is_idle(&mut qa));
        assert!(a.is_active());
    }

    #[test]
    fn test_route_to_missing_target_fails() {
        let registry = SessionRegistry::new();
        let (_a, _qa) = add(&registry, "a");
        let resp = ServerResponse::to(cid("gone"), Message::from_text("?"));
        assert!(!registry.route(&cid("a"), &resp));
    }

    // =====================================================================
    // evict_idle()
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_removes_only_stale_sessions() {
        let registry = SessionRegistry::new();
        let (stale, _q1) = add(&registry, "stale");
        let (fresh, _q2) = add(&registry, "fresh");

        tokio::time::sleep(Duration::from_secs(30)).await;
        fresh.touch();

        let evicted = registry.evict_idle(Duration::from_secs(30));
        assert_eq!(evicted, vec![cid("stale")]);
        assert!(!stale.is_active());
        assert!(fresh.is_active());
        assert_eq!(registry.client_ids(), vec![cid("fresh")]);
    }
}
