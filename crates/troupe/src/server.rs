//! `Server` builder, accept loop, and per-session tasks.
//!
//! This is the entry point for running a troupe server. It ties the layers
//! together: transport → protocol → session → your [`ServerHandler`].
//!
//! Every accepted session gets two tasks:
//!
//! ```text
//!            ┌─ receiver: frame → touch → on_receive → route ─┐
//! socket ────┤                                                 ├── registry
//!            └─ sender:   queue → drain batch → write, flush ──┘
//! ```
//!
//! Either task, the reaper, or a [`ServerHandle`] may close the session.
//! The receiver always performs the teardown, so `on_disconnect` runs
//! exactly once.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::SinkExt;
use troupe_protocol::{ClientId, Message, ServerResponse};
use troupe_session::{
    OutboundQueue, Session, SessionRegistry, derive_client_id, spawn_reaper,
};
use troupe_transport::{
    Accepted, FrameSink, FrameStream, TcpTransport, Transport, read_frame,
};
use tokio_util::sync::CancellationToken;

use crate::{ServerConfig, ServerHandler, TroupeError};

/// Shared server state passed to each session task.
pub(crate) struct ServerState<H: ServerHandler> {
    pub(crate) handler: H,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) config: ServerConfig,
    pub(crate) shutdown: CancellationToken,
}

/// Builder for configuring a [`Server`].
///
/// # Example
///
/// ```rust,ignore
/// let server = ServerBuilder::new()
///     .bind("0.0.0.0:9000")
///     .config(ServerConfig::default())
///     .build(my_handler)
///     .await?;
/// server.run().await
/// ```
pub struct ServerBuilder {
    bind_addr: String,
    config: ServerConfig,
    registry: Option<Arc<SessionRegistry>>,
}

impl ServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            config: ServerConfig::default(),
            registry: None,
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing registry instead of a fresh one.
    pub(crate) fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Binds the listener. The server doesn't accept anything until
    /// [`Server::run`] is called.
    pub async fn build<H: ServerHandler>(
        self,
        handler: H,
    ) -> Result<Server<H>, TroupeError> {
        let transport =
            TcpTransport::bind(&self.bind_addr, self.config.framing()).await?;

        let state = Arc::new(ServerState {
            handler,
            registry: self.registry.unwrap_or_default(),
            config: self.config,
            shutdown: CancellationToken::new(),
        });

        Ok(Server { transport, state })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A troupe server.
///
/// Call [`run()`](Self::run) to start accepting connections, and keep a
/// [`ServerHandle`] around to talk to clients or stop it.
pub struct Server<H: ServerHandler> {
    transport: TcpTransport,
    state: Arc<ServerState<H>>,
}

impl<H: ServerHandler> Server<H> {
    /// Binds to `addr` with default settings.
    pub async fn bind(addr: &str, handler: H) -> Result<Self, TroupeError> {
        ServerBuilder::new().bind(addr).build(handler).await
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TroupeError> {
        Ok(self.transport.local_addr()?)
    }

    /// A handle that stays valid after `run()` consumed the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.state.registry),
            shutdown: self.state.shutdown.clone(),
        }
    }

    /// The application handler.
    pub fn handler(&self) -> &H {
        &self.state.handler
    }

    /// Runs the accept loop and the reaper until [`ServerHandle::stop`].
    ///
    /// On stop every live session is closed; their teardown (and
    /// `on_disconnect`) completes on the session tasks.
    pub async fn run(mut self) -> Result<(), TroupeError> {
        let local_addr = self.local_addr()?;
        tracing::info!(%local_addr, "troupe server running");

        let shutdown = self.state.shutdown.clone();
        let reaper = spawn_reaper(
            Arc::clone(&self.state.registry),
            self.state.config.session(),
            shutdown.clone(),
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok(accepted) => self.open_session(accepted),
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        self.state.registry.close_all();
        if let Err(e) = reaper.await {
            tracing::debug!(error = %e, "reaper task ended abnormally");
        }
        tracing::info!(%local_addr, "troupe server stopped");
        Ok(())
    }

    fn open_session(&self, accepted: Accepted) {
        let Accepted {
            sink,
            stream,
            peer_addr,
            local_addr,
        } = accepted;
        let client_id = derive_client_id(peer_addr, local_addr);

        if !self.state.handler.on_connect(&client_id, peer_addr) {
            tracing::info!(%client_id, %peer_addr, "connection rejected");
            return;
        }

        let (session, queue) = Session::new(client_id, peer_addr);
        let session = Arc::new(session);
        self.state.registry.insert(Arc::clone(&session));
        tracing::info!(client_id = %session.id(), %peer_addr, "session created");

        tokio::spawn(send_loop(Arc::clone(&session), queue, sink));
        tokio::spawn(receive_loop(Arc::clone(&self.state), session, stream));
    }
}

/// Cloneable control surface of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Queues `message` for one client. `true` once enqueued.
    pub fn send(&self, client: &ClientId, message: Message) -> bool {
        self.registry.send(client, message)
    }

    /// Queues `message` for every connected client; `true` only if every
    /// session accepted it.
    pub fn broadcast(&self, message: &Message) -> bool {
        self.registry.broadcast(message)
    }

    /// Delivers `response` as if the handler had returned it for a message
    /// from `from`.
    pub fn route(&self, from: &ClientId, response: &ServerResponse) -> bool {
        self.registry.route(from, response)
    }

    /// Closes one client's session. `false` if it wasn't connected.
    pub fn disconnect(&self, client: &ClientId) -> bool {
        self.registry.disconnect(client)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Ids of all live sessions.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.registry.client_ids()
    }

    /// Stops the accept loop and the reaper and closes every session.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Drains the session's queue onto the socket until the session closes.
async fn send_loop(session: Arc<Session>, mut queue: OutboundQueue, mut sink: FrameSink) {
    let mut batch = Vec::new();
    'session: loop {
        let more = tokio::select! {
            biased;
            more = queue.next_batch(&mut batch) => more,
            _ = session.closed() => false,
        };
        if !more {
            break;
        }

        for message in batch.drain(..) {
            if let Err(e) = sink.feed(message.to_frame()).await {
                tracing::debug!(client_id = %session.id(), error = %e, "write failed");
                session.close();
                break 'session;
            }
        }
        if let Err(e) = sink.flush().await {
            tracing::debug!(client_id = %session.id(), error = %e, "flush failed");
            session.close();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(client_id = %session.id(), error = %e, "error closing socket");
    }
}

/// Reads the session's socket until it fails or the session closes, then
/// tears the session down.
async fn receive_loop<H: ServerHandler>(
    state: Arc<ServerState<H>>,
    session: Arc<Session>,
    mut stream: FrameStream,
) {
    let client_id = session.id().clone();

    loop {
        let frame = tokio::select! {
            _ = session.closed() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(%client_id, "client closed the connection");
                break;
            }
            Err(e) => {
                tracing::debug!(%client_id, error = %e, "read failed");
                break;
            }
        };

        session.touch();
        let message = match Message::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%client_id, error = %e, "malformed frame");
                break;
            }
        };
        tracing::debug!(%client_id, bytes = message.size(), "received");

        match state.handler.on_receive(&client_id, message).await {
            Some(response) => {
                if !state.registry.route(&client_id, &response) {
                    tracing::debug!(%client_id, "response not delivered to every recipient");
                }
            }
            None => {
                tracing::debug!(%client_id, "handler ended the session");
                break;
            }
        }
    }

    session.close();
    state.registry.remove(&session);
    state.handler.on_disconnect(&client_id);
    tracing::info!(%client_id, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refuser;

    impl ServerHandler for Refuser {
        fn on_connect(&self, _client: &ClientId, _peer_addr: SocketAddr) -> bool {
            false
        }

        async fn on_receive(&self, _client: &ClientId, _message: Message) -> Option<ServerResponse> {
            None
        }
    }

    #[tokio::test]
    async fn test_builder_binds_ephemeral_port() {
        let server = ServerBuilder::new()
            .bind("127.0.0.1:0")
            .build(Refuser)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.handle().session_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_to_invalid_address_fails() {
        let result = Server::bind("not an address", Refuser).await;
        assert!(matches!(result, Err(TroupeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        let server = Server::bind("127.0.0.1:0", Refuser).await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        handle.stop();
        assert!(handle.is_stopped());
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("run should return after stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_connection_gets_no_session() {
        let server = Server::bind("127.0.0.1:0", Refuser).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let handle = server.handle();
        tokio::spawn(server.run());

        let (_sink, mut stream) = troupe_transport::connect(
            &addr,
            std::time::Duration::from_secs(2),
            Default::default(),
        )
        .await
        .unwrap();

        // The server drops the socket straight away.
        let next = read_frame(&mut stream).await;
        assert!(matches!(next, Ok(None) | Err(_)));
        assert_eq!(handle.session_count(), 0);
        handle.stop();
    }
}
