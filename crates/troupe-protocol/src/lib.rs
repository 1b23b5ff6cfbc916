//! Wire protocol for troupe.
//!
//! This crate defines what travels inside a transport frame:
//!
//! - **Envelope** ([`Message`], [`ServerResponse`], [`Recipient`],
//!   [`ClientId`]): a timestamped payload and the addressing a server
//!   attaches to its replies.
//! - **Secure frames** ([`SecureFrame`], [`EncryptionKey`], [`SafeMessage`]):
//!   the handshake and encrypted-block shapes used by the secure channel.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) plus deflate compression:
//!   how values become payload bytes.
//! - **Commands** ([`Command`], [`TaggedCommand`]): kind-tagged payloads
//!   for the type router.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (frames) → Protocol (Message) → Session / Router
//! ```

mod codec;
mod command;
mod compression;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use command::{Command, TaggedCommand};
pub use compression::{compress, decompress};
pub use error::ProtocolError;
pub use types::{
    ClientId, EncryptionKey, FRAME_HEADER_LEN, Message, Recipient,
    SafeMessage, SecureFrame, ServerResponse, now_millis,
};
