//! Unified error type for troupe.

use std::time::Duration;

use troupe_protocol::ProtocolError;
use troupe_session::SessionError;
use troupe_transport::TransportError;

use crate::secure::CryptoError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each wrapping variant generates the `From`
/// impl, so `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TroupeError {
    /// A transport-level error (bind, connect, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, malformed frame).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown or closed session).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A secure-channel crypto error (keys, encryption, decryption).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// Messages without payload are never sent.
    #[error("refusing to send an empty message")]
    EmptyMessage,

    /// The peer's public key hasn't arrived yet.
    #[error("secure handshake has not completed")]
    HandshakePending,

    /// The peer never answered the key exchange.
    #[error("secure handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}
