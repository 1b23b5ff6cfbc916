//! Application hooks for both ends of a connection.
//!
//! troupe doesn't know what your messages mean. It moves frames, keeps
//! sessions alive, and calls into one of two traits:
//!
//! - [`ClientHandler`]: plugged into a [`Connection`](crate::Connection),
//!   called for every message the server sends.
//! - [`ServerHandler`]: plugged into a [`Server`](crate::Server), called on
//!   connect, on every inbound message, and on disconnect.
//!
//! Both traits are `Send + Sync + 'static` because the framework shares a
//! single handler between all connection tasks.

use std::future::Future;
use std::net::SocketAddr;

use troupe_protocol::{ClientId, Message, ServerResponse};

/// Receives what a server sends to one client connection.
///
/// # Example
///
/// ```rust
/// use troupe::{ClientHandler, Message};
///
/// /// Prints every message and never answers.
/// struct Printer;
///
/// impl ClientHandler for Printer {
///     async fn on_receive(&self, message: Message) -> Option<Message> {
///         println!("{:?}", message.as_text());
///         None
///     }
/// }
/// ```
pub trait ClientHandler: Send + Sync + 'static {
    /// Called on the receive task for every inbound message, in arrival
    /// order.
    ///
    /// # Returns
    /// - `Some(message)`: sent back to the server on the same connection
    /// - `None`: nothing to send
    fn on_receive(
        &self,
        message: Message,
    ) -> impl Future<Output = Option<Message>> + Send;

    /// Called once when the connection fails (peer closed, read error,
    /// oversized frame). Not called after a voluntary
    /// [`disconnect`](crate::Connection::disconnect).
    fn on_connection_lost(&self, reason: &str) {
        let _ = reason;
    }
}

/// Server-side application logic.
///
/// # Example
///
/// ```rust
/// use troupe::{ClientId, Message, ServerHandler, ServerResponse};
///
/// /// Echoes every message back to whoever sent it.
/// struct Echo;
///
/// impl ServerHandler for Echo {
///     async fn on_receive(
///         &self,
///         _client: &ClientId,
///         message: Message,
///     ) -> Option<ServerResponse> {
///         Some(ServerResponse::reply(message))
///     }
/// }
/// ```
pub trait ServerHandler: Send + Sync + 'static {
    /// Decides whether a freshly accepted socket becomes a session.
    ///
    /// Returning `false` closes the socket; no session is created and
    /// [`on_disconnect`](Self::on_disconnect) is never called for it.
    fn on_connect(&self, client: &ClientId, peer_addr: SocketAddr) -> bool {
        let _ = (client, peer_addr);
        true
    }

    /// Called on the session's receive task for every inbound message.
    ///
    /// # Returns
    /// - `Some(response)`: routed per its [`Recipient`](crate::Recipient);
    ///   a response without a message is an acknowledgement and sends
    ///   nothing
    /// - `None`: the session is torn down
    fn on_receive(
        &self,
        client: &ClientId,
        message: Message,
    ) -> impl Future<Output = Option<ServerResponse>> + Send;

    /// Called exactly once per accepted session, after it has been closed
    /// and unregistered.
    fn on_disconnect(&self, client: &ClientId) {
        let _ = client;
    }
}
