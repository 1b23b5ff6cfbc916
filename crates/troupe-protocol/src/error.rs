//! Error types for the protocol layer.
//!
//! When you see a `ProtocolError`, the bytes arrived fine but could not be
//! turned into (or produced from) the value you asked for.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into bytes).
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust value).
    ///
    /// Common causes: foreign bytes, a payload of a different shape, or a
    /// peer running a different message schema.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// Deflating or inflating a payload failed.
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    /// The message is invalid at the protocol level.
    ///
    /// Used for frames that are too short to carry a header and for
    /// tagged payloads whose kind does not match what was asked for.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
