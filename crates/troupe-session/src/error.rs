//! Error types for the session layer.

use troupe_protocol::ClientId;

/// Errors that can occur when delivering to a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session is registered under this id. The client may never have
    /// connected, or its session already ended.
    #[error("session not found for client {0}")]
    NotFound(ClientId),

    /// The session exists but is shutting down; its queue no longer drains.
    #[error("session for client {0} is closed")]
    Closed(ClientId),

    /// The message has no payload, so there is nothing to deliver.
    #[error("refusing to queue an empty message for client {0}")]
    EmptyMessage(ClientId),
}
