//! Client side of the secure channel.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::watch;
use troupe_protocol::{Message, SecureFrame};

use super::{KeyPair, PeerKey};
use crate::{ClientHandler, Connection, ConnectionConfig, SecureConfig, TroupeError};

/// Wraps the application's handler: completes the handshake and opens
/// sealed frames before the application sees them.
pub struct SecureClientHandler<H> {
    inner: H,
    keys: Arc<KeyPair>,
    server_key: watch::Sender<Option<Arc<PeerKey>>>,
}

impl<H> SecureClientHandler<H> {
    /// The application's handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn server_key(&self) -> Option<Arc<PeerKey>> {
        self.server_key.borrow().clone()
    }
}

impl<H: ClientHandler> ClientHandler for SecureClientHandler<H> {
    async fn on_receive(&self, message: Message) -> Option<Message> {
        let frame: SecureFrame = match message.unwrap() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable secure frame");
                return None;
            }
        };

        let sealed = match frame {
            SecureFrame::Key(announced) => {
                if self.server_key().is_some() {
                    tracing::warn!("server announced a second key; keeping the first");
                    return None;
                }
                match PeerKey::try_from(&announced) {
                    Ok(key) => {
                        tracing::info!(block_size = key.block_size(), "server key received");
                        self.server_key.send_replace(Some(Arc::new(key)));
                    }
                    Err(e) => tracing::warn!(error = %e, "rejecting server key"),
                }
                return None;
            }
            SecureFrame::Sealed(sealed) => sealed,
        };

        let Some(server_key) = self.server_key() else {
            tracing::warn!("sealed frame before the server key; ignoring");
            return None;
        };
        let message = match self
            .keys
            .open(&sealed)
            .map_err(TroupeError::from)
            .and_then(|plain| Ok(Message::from_frame(BytesMut::from(&plain[..]))?))
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping sealed frame");
                return None;
            }
        };

        let answer = self.inner.on_receive(message).await?;
        match seal(&server_key, &answer) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                tracing::warn!(error = %e, "dropping follow-up");
                None
            }
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        self.server_key.send_replace(None);
        self.inner.on_connection_lost(reason);
    }
}

/// Encrypts `message` for the holder of `key` and wraps it as a plain
/// message ready for the wire.
pub(crate) fn seal(key: &PeerKey, message: &Message) -> Result<Message, TroupeError> {
    let sealed = key.seal(&message.to_frame())?;
    Ok(Message::wrap(&SecureFrame::Sealed(sealed))?)
}

/// A client connection whose application traffic is RSA-encrypted.
///
/// `connect()` performs the key exchange and returns once the server's key
/// is known, so `send` works right after it.
pub struct SafeConnection<H: ClientHandler> {
    connection: Connection<SecureClientHandler<H>>,
    keys: Arc<KeyPair>,
    server_key: watch::Receiver<Option<Arc<PeerKey>>>,
    config: SecureConfig,
}

impl<H: ClientHandler> SafeConnection<H> {
    /// Creates a disconnected secure connection with default settings.
    ///
    /// Generates the client's key pair.
    pub fn new(addr: impl Into<String>, handler: H) -> Result<Self, TroupeError> {
        Self::with_config(addr, ConnectionConfig::default(), SecureConfig::default(), handler)
    }

    /// Creates a disconnected secure connection.
    pub fn with_config(
        addr: impl Into<String>,
        connection: ConnectionConfig,
        config: SecureConfig,
        handler: H,
    ) -> Result<Self, TroupeError> {
        let keys = Arc::new(KeyPair::generate(config.key_bits)?);
        let (tx, server_key) = watch::channel(None);
        let handler = SecureClientHandler {
            inner: handler,
            keys: Arc::clone(&keys),
            server_key: tx,
        };
        Ok(Self {
            connection: Connection::with_config(addr, connection, handler),
            keys,
            server_key,
            config,
        })
    }

    /// The application's handler.
    pub fn handler(&self) -> &H {
        self.connection.handler().inner()
    }

    /// `true` while the underlying connection is up.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// `true` once the server's key has arrived on the current connection.
    pub fn is_secured(&self) -> bool {
        self.server_key.borrow().is_some()
    }

    /// Largest plaintext block the server may seal for us.
    pub fn block_size(&self) -> usize {
        self.keys.block_size()
    }

    /// Connects, announces our key, and waits for the server's.
    ///
    /// # Errors
    /// - `Transport` if the server can't be reached
    /// - `HandshakeTimeout` if the server's key doesn't arrive in time;
    ///   the connection is closed again
    pub async fn connect(&self) -> Result<(), TroupeError> {
        if self.is_connected() && self.is_secured() {
            return Ok(());
        }
        self.connection.connect().await?;

        let hello = Message::wrap(&SecureFrame::Key(self.keys.encryption_key().clone()))?;
        self.connection.send(hello).await?;

        let mut server_key = self.server_key.clone();
        let timeout = self.config.handshake_timeout;
        let arrived = match tokio::time::timeout(timeout, server_key.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => false,
        };
        if !arrived {
            tracing::warn!(addr = %self.connection.addr(), ?timeout, "secure handshake timed out");
            self.disconnect().await;
            return Err(TroupeError::HandshakeTimeout(timeout));
        }

        tracing::info!(addr = %self.connection.addr(), "secure handshake complete");
        Ok(())
    }

    /// Seals and sends one message.
    ///
    /// # Errors
    /// - `EmptyMessage` if the message has no payload
    /// - `HandshakePending` before the server's key arrived
    /// - `NotConnected` / `Transport` as for a plain connection
    pub async fn send(&self, message: Message) -> Result<(), TroupeError> {
        if message.is_empty() {
            return Err(TroupeError::EmptyMessage);
        }
        let server_key = self
            .server_key
            .borrow()
            .clone()
            .ok_or(TroupeError::HandshakePending)?;
        let sealed = seal(&server_key, &message)?;
        self.connection.send(sealed).await
    }

    /// Closes the connection and forgets the server's key.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.connection.handler().server_key.send_replace(None);
    }
}
