//! RSA-encrypted variant of the plain channel.
//!
//! The secure channel runs on top of an ordinary connection. Every plain
//! [`Message`](crate::Message) on the wire carries a
//! [`SecureFrame`](crate::SecureFrame):
//!
//! ```text
//! client                                   server
//!   │ ── Key(client public key) ─────────────→ │  store per client
//!   │ ←──────────── Key(server public key) ─── │
//!   │ ── Sealed(blocks under server key) ────→ │  open → handler → seal
//!   │ ←─── Sealed(blocks under client key) ─── │
//! ```
//!
//! Keys are not authenticated: whoever answers the first key announcement
//! is trusted.

mod connection;
mod crypto;
mod server;

pub use connection::{SafeConnection, SecureClientHandler};
pub use crypto::{CryptoError, KeyPair, PeerKey};
pub use server::{SafeServer, SecureServerHandle, SecureServerHandler};
