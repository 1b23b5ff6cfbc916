//! # troupe
//!
//! Framed TCP messaging for request/reply services.
//!
//! troupe moves timestamped [`Message`]s between clients and a server over
//! persistent TCP connections and gives you three levels to build on:
//!
//! - **Plain channel**: [`Connection`] + [`ClientHandler`] on the client,
//!   [`Server`] + [`ServerHandler`] on the server. The server keeps one
//!   session per client, routes every [`ServerResponse`] to its
//!   [`Recipient`], and evicts idle sessions.
//! - **Secure channel**: [`SafeConnection`] and [`SafeServer`] wrap the
//!   same handlers and RSA-encrypt everything after a key exchange.
//! - **Type router**: a [`Theater`] of [`Actor`]s on the server and a
//!   [`Puppeteer`] of [`Dispatcher`]s on the client exchange [`Command`]s
//!   routed by their exact kind.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use troupe::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping;
//! impl_command!(Ping, "ping");
//!
//! #[derive(Serialize, Deserialize)]
//! struct Pong;
//! impl_command!(Pong, "pong");
//!
//! # async fn demo() -> Result<(), TroupeError> {
//! let theater = Theater::new();
//! theater.register_actor(|_client: &ClientId, _ping: Ping| Some(Pong));
//! let server = theater.bind("127.0.0.1:9000").await?;
//! tokio::spawn(server.run());
//!
//! let puppeteer = Puppeteer::connect("127.0.0.1:9000").await?;
//! puppeteer.register_dispatcher(|_pong: Pong| None::<Ping>);
//! puppeteer.give_command(&Ping).await?;
//! # Ok(())
//! # }
//! ```

pub mod actors;
mod config;
mod connection;
mod error;
mod handler;
pub mod secure;
mod server;

pub use actors::{Actor, ClientChannel, Dispatcher, Dispatchers, Puppeteer, Theater};
pub use config::{ConnectionConfig, SecureConfig, ServerConfig};
pub use connection::Connection;
pub use error::TroupeError;
pub use handler::{ClientHandler, ServerHandler};
pub use secure::{CryptoError, SafeConnection, SafeServer, SecureServerHandle};
pub use server::{Server, ServerBuilder, ServerHandle};

pub use troupe_protocol::{
    ClientId, Command, EncryptionKey, Message, ProtocolError, Recipient,
    SafeMessage, SecureFrame, ServerResponse, TaggedCommand, impl_command,
};
pub use troupe_session::SessionError;
pub use troupe_transport::TransportError;

/// Everything an application usually needs, in one import.
pub mod prelude {
    pub use crate::{
        Actor, ClientChannel, ClientHandler, ClientId, Command, Connection,
        ConnectionConfig, Dispatcher, Message, Puppeteer, Recipient,
        SafeConnection, SafeServer, SecureConfig, SecureServerHandle, Server,
        ServerBuilder, ServerConfig, ServerHandle, ServerHandler, ServerResponse,
        Theater, TroupeError, impl_command,
    };
}
