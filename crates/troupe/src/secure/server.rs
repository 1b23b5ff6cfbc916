//! Server side of the secure channel.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use troupe_protocol::{
    ClientId, EncryptionKey, Message, Recipient, SecureFrame, ServerResponse,
};
use troupe_session::SessionRegistry;

use super::connection::seal;
use super::{KeyPair, PeerKey};
use crate::{
    SecureConfig, Server, ServerBuilder, ServerConfig, ServerHandle, ServerHandler, TroupeError,
};

/// Client keys and the registry they seal for. Shared by the handler and
/// every [`SecureServerHandle`].
struct Keyring {
    /// Public key per client, learned during the handshake.
    client_keys: DashMap<ClientId, Arc<PeerKey>>,
    registry: Arc<SessionRegistry>,
}

impl Keyring {
    fn knows(&self, client: &ClientId) -> bool {
        self.client_keys.contains_key(client)
    }

    fn client_key(&self, client: &ClientId) -> Option<Arc<PeerKey>> {
        self.client_keys.get(client).map(|entry| Arc::clone(entry.value()))
    }

    fn seal_for(&self, client: &ClientId, message: &Message) -> Option<Message> {
        let Some(key) = self.client_key(client) else {
            tracing::warn!(%client, "no key for recipient; not sending");
            return None;
        };
        match seal(&key, message) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                tracing::warn!(%client, error = %e, "sealing failed");
                None
            }
        }
    }

    fn accept_key(&self, client: &ClientId, announced: &EncryptionKey) {
        if self.knows(client) {
            tracing::warn!(%client, "client announced a second key; keeping the first");
            return;
        }
        match PeerKey::try_from(announced) {
            Ok(key) => {
                self.client_keys.insert(client.clone(), Arc::new(key));
                tracing::info!(%client, "client key received");
            }
            Err(e) => tracing::warn!(%client, error = %e, "rejecting client key"),
        }
    }

    /// Seals `message` under `client`'s key and queues it.
    fn send(&self, client: &ClientId, message: &Message) -> bool {
        match self.seal_for(client, message) {
            Some(sealed) => self.registry.send(client, sealed),
            None => false,
        }
    }

    /// One sealed copy per client. A client without a key counts as a
    /// failed delivery.
    fn broadcast(&self, message: &Message) -> bool {
        let mut delivered = true;
        for client in self.registry.client_ids() {
            delivered &= self.send(&client, message);
        }
        delivered
    }

    fn route(&self, from: &ClientId, response: &ServerResponse) -> bool {
        let Some(message) = response.message() else {
            return true;
        };
        match response.recipient() {
            Recipient::Sender => self.send(from, message),
            Recipient::Client(target) => self.send(target, message),
            Recipient::Broadcast => self.broadcast(message),
        }
    }
}

/// Wraps the application's handler: answers key announcements, opens
/// sealed frames, and seals every response for its recipient.
pub struct SecureServerHandler<H> {
    inner: H,
    keys: KeyPair,
    keyring: Arc<Keyring>,
}

impl<H> SecureServerHandler<H> {
    /// The application's handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// `true` once `client` has completed the handshake.
    pub fn knows(&self, client: &ClientId) -> bool {
        self.keyring.knows(client)
    }

    /// Seals and queues a response itself; the plain router only ever sees
    /// an acknowledgement.
    fn seal_response(&self, from: &ClientId, response: &ServerResponse) -> ServerResponse {
        if !self.keyring.route(from, response) {
            tracing::debug!(%from, "sealed response not delivered to every recipient");
        }
        ServerResponse::nothing()
    }
}

impl<H: ServerHandler> ServerHandler for SecureServerHandler<H> {
    fn on_connect(&self, client: &ClientId, peer_addr: SocketAddr) -> bool {
        self.inner.on_connect(client, peer_addr)
    }

    async fn on_receive(&self, client: &ClientId, message: Message) -> Option<ServerResponse> {
        let frame: SecureFrame = match message.unwrap() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%client, error = %e, "ignoring undecodable secure frame");
                return Some(ServerResponse::nothing());
            }
        };

        let sealed = match frame {
            SecureFrame::Key(announced) => {
                self.keyring.accept_key(client, &announced);
                return match Message::wrap(&SecureFrame::Key(self.keys.encryption_key().clone())) {
                    Ok(ours) => Some(ServerResponse::reply(ours)),
                    Err(e) => {
                        tracing::warn!(%client, error = %e, "could not encode server key");
                        Some(ServerResponse::nothing())
                    }
                };
            }
            SecureFrame::Sealed(sealed) => sealed,
        };

        if !self.knows(client) {
            tracing::warn!(%client, "sealed frame before the client key; ignoring");
            return Some(ServerResponse::nothing());
        }
        let opened = self
            .keys
            .open(&sealed)
            .map_err(TroupeError::from)
            .and_then(|plain| Ok(Message::from_frame(BytesMut::from(&plain[..]))?));
        let message = match opened {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%client, error = %e, "dropping sealed frame");
                return Some(ServerResponse::nothing());
            }
        };

        let response = self.inner.on_receive(client, message).await?;
        Some(self.seal_response(client, &response))
    }

    fn on_disconnect(&self, client: &ClientId) {
        self.keyring.client_keys.remove(client);
        self.inner.on_disconnect(client);
    }
}

/// A server whose application traffic is RSA-encrypted per client.
///
/// The application handler sees plain [`Message`]s and returns plain
/// [`ServerResponse`]s; the wrapper handles keys and encryption.
pub struct SafeServer<H: ServerHandler> {
    server: Server<SecureServerHandler<H>>,
    keyring: Arc<Keyring>,
}

impl<H: ServerHandler> SafeServer<H> {
    /// Binds to `addr` with default settings.
    pub async fn bind(addr: &str, handler: H) -> Result<Self, TroupeError> {
        Self::bind_with(addr, ServerConfig::default(), SecureConfig::default(), handler).await
    }

    /// Binds to `addr`, generating the server's key pair first.
    pub async fn bind_with(
        addr: &str,
        config: ServerConfig,
        secure: SecureConfig,
        handler: H,
    ) -> Result<Self, TroupeError> {
        let registry = Arc::new(SessionRegistry::new());
        let keyring = Arc::new(Keyring {
            client_keys: DashMap::new(),
            registry: Arc::clone(&registry),
        });
        let handler = SecureServerHandler {
            inner: handler,
            keys: KeyPair::generate(secure.key_bits)?,
            keyring: Arc::clone(&keyring),
        };
        let server = ServerBuilder::new()
            .bind(addr)
            .config(config)
            .registry(registry)
            .build(handler)
            .await?;
        Ok(Self { server, keyring })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TroupeError> {
        self.server.local_addr()
    }

    /// A handle that seals everything it sends; stays valid after `run()`.
    pub fn handle(&self) -> SecureServerHandle {
        SecureServerHandle {
            control: self.server.handle(),
            keyring: Arc::clone(&self.keyring),
        }
    }

    /// The application handler.
    pub fn handler(&self) -> &H {
        self.server.handler().inner()
    }

    /// Runs until [`SecureServerHandle::stop`].
    pub async fn run(self) -> Result<(), TroupeError> {
        self.server.run().await
    }
}

/// Cloneable control surface of a running [`SafeServer`].
///
/// Same addressing as [`ServerHandle`], but every message is sealed under
/// the recipient's key. Clients that haven't finished the handshake can't
/// be reached and count as failed deliveries.
#[derive(Clone)]
pub struct SecureServerHandle {
    control: ServerHandle,
    keyring: Arc<Keyring>,
}

impl SecureServerHandle {
    /// Seals and queues `message` for one client. `true` once enqueued.
    pub fn send(&self, client: &ClientId, message: Message) -> bool {
        self.keyring.send(client, &message)
    }

    /// Seals and queues `message` for every connected client; `true` only
    /// if every one of them got it.
    pub fn broadcast(&self, message: &Message) -> bool {
        self.keyring.broadcast(message)
    }

    /// Delivers `response` as if the handler had returned it for a message
    /// from `from`.
    pub fn route(&self, from: &ClientId, response: &ServerResponse) -> bool {
        self.keyring.route(from, response)
    }

    /// `true` once `client` has completed the handshake.
    pub fn is_secured(&self, client: &ClientId) -> bool {
        self.keyring.knows(client)
    }

    /// Closes one client's session. `false` if it wasn't connected.
    pub fn disconnect(&self, client: &ClientId) -> bool {
        self.control.disconnect(client)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.control.session_count()
    }

    /// Ids of all live sessions.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.control.client_ids()
    }

    /// Stops the server and closes every session.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }
}
