//! Per-client sessions for troupe servers.
//!
//! This crate holds the server-side bookkeeping for connected clients:
//!
//! 1. **Identity** ([`derive_client_id`]): a stable id per accepted socket
//! 2. **Sessions** ([`Session`], [`OutboundQueue`]): liveness, idle time,
//!    and a per-client outbound queue drained by one writer task
//! 3. **Registry** ([`SessionRegistry`]): the concurrent map of live
//!    sessions, with unicast, broadcast, and response routing
//! 4. **Reaper** ([`spawn_reaper`]): periodic eviction of idle sessions
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)  ← accepts sockets, runs reader/writer tasks per session
//!     ↕
//! Session Layer (this crate)  ← who is connected, what to send them
//!     ↕
//! Protocol Layer (below)  ← provides ClientId, Message, ServerResponse
//! ```

mod error;
mod identity;
mod reaper;
mod registry;
mod session;

pub use error::SessionError;
pub use identity::derive_client_id;
pub use reaper::spawn_reaper;
pub use registry::SessionRegistry;
pub use session::{OutboundQueue, Session, SessionConfig};
