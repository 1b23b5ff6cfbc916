//! Transport layer for troupe.
//!
//! Provides the [`Transport`] trait for accepting peers and a TCP
//! implementation ([`TcpTransport`], [`connect`]) that turns a raw byte
//! stream into a sequence of length-delimited frames.
//!
//! # Wire framing
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.
//! What the bytes mean is the protocol layer's business; this crate only
//! guarantees that one `send` on one side is one frame on the other.

mod error;
mod tcp;

pub use error::TransportError;
pub use tcp::{
    Accepted, FrameSink, FrameStream, TcpTransport, connect, read_frame,
    write_frame,
};

use std::future::Future;
use std::net::SocketAddr;

use tokio_util::codec::LengthDelimitedCodec;

/// Default upper bound for a single frame (8 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Framing parameters shared by both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Frames longer than this are rejected as a receive error.
    pub max_frame_length: usize,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl Framing {
    /// Builds the length-delimited codec for these parameters.
    pub fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.max_frame_length)
            .new_codec()
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + 'static {
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Accepted, Self::Error>> + Send;

    /// Returns the address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, Self::Error>;
}
