//! Client-side command sender and reply router.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use troupe_protocol::{Command, Message};

use super::{ClientChannel, Dispatcher, ErasedDispatcher, TypedDispatcher};
use crate::{
    ClientHandler, Connection, ConnectionConfig, SafeConnection, SecureConfig, TroupeError,
};

/// The reply table of a [`Puppeteer`], and the [`ClientHandler`] that
/// consults it.
///
/// Clones share the table, so dispatchers registered through the
/// puppeteer apply to replies already in flight.
#[derive(Clone, Default)]
pub struct Dispatchers {
    table: Arc<DashMap<&'static str, Arc<dyn ErasedDispatcher>>>,
}

impl Dispatchers {
    fn insert<T, D>(&self, dispatcher: D)
    where
        T: Command,
        D: Dispatcher<T>,
    {
        let erased: Arc<dyn ErasedDispatcher> = Arc::new(TypedDispatcher {
            dispatcher,
            _reply: PhantomData::<fn(T)>,
        });
        if self.table.insert(T::KIND, erased).is_some() {
            tracing::debug!(kind = T::KIND, "dispatcher replaced");
        }
    }

    /// Routes one reply; returns the encoded follow-up, if any.
    fn route(&self, message: &Message) -> Option<Message> {
        let reply = match message.open_command() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "not a command; ignoring");
                return None;
            }
        };
        let Some(dispatcher) = self.table.get(reply.kind()).map(|entry| Arc::clone(entry.value()))
        else {
            tracing::warn!(kind = reply.kind(), "no dispatcher for reply");
            return None;
        };

        let kind = reply.kind().to_string();
        match dispatcher.dispatch(reply) {
            Ok(next) => next,
            Err(miss) => {
                tracing::error!(%kind, error = %miss, "dispatcher gave no answer");
                None
            }
        }
    }
}

impl ClientHandler for Dispatchers {
    async fn on_receive(&self, message: Message) -> Option<Message> {
        self.route(&message)
    }

    fn on_connection_lost(&self, reason: &str) {
        tracing::info!(%reason, "show finished");
    }
}

/// Sends commands to a [`Theater`](super::Theater) and routes its replies
/// to the dispatcher registered for each reply kind.
///
/// Connects as soon as it is created.
pub struct Puppeteer<C: ClientChannel> {
    channel: C,
    dispatchers: Dispatchers,
}

impl Puppeteer<Connection<Dispatchers>> {
    /// Connects over a plain channel with default settings.
    pub async fn connect(addr: &str) -> Result<Self, TroupeError> {
        Self::connect_with(addr, ConnectionConfig::default()).await
    }

    /// Connects over a plain channel.
    pub async fn connect_with(addr: &str, config: ConnectionConfig) -> Result<Self, TroupeError> {
        let dispatchers = Dispatchers::default();
        let channel = Connection::with_config(addr, config, dispatchers.clone());
        Self::with_channel(channel, dispatchers).await
    }
}

impl Puppeteer<SafeConnection<Dispatchers>> {
    /// Connects over the secure channel, completing the key exchange.
    pub async fn connect_secure(addr: &str, config: SecureConfig) -> Result<Self, TroupeError> {
        let dispatchers = Dispatchers::default();
        let channel = SafeConnection::with_config(
            addr,
            ConnectionConfig::default(),
            config,
            dispatchers.clone(),
        )?;
        Self::with_channel(channel, dispatchers).await
    }
}

impl<C: ClientChannel> Puppeteer<C> {
    /// Connects `channel`, whose handler must share `dispatchers`.
    pub async fn with_channel(channel: C, dispatchers: Dispatchers) -> Result<Self, TroupeError> {
        channel.connect().await?;
        Ok(Self {
            channel,
            dispatchers,
        })
    }

    /// Registers `dispatcher` for replies of kind `T::KIND`, replacing any
    /// previous dispatcher for that kind.
    pub fn register_dispatcher<T, D>(&self, dispatcher: D)
    where
        T: Command,
        D: Dispatcher<T>,
    {
        self.dispatchers.insert::<T, D>(dispatcher);
    }

    /// Sends one command.
    pub async fn give_command<T: Command>(&self, command: &T) -> Result<(), TroupeError> {
        let message = Message::command(command)?;
        tracing::debug!(kind = T::KIND, "giving command");
        self.channel.send(message).await
    }

    /// `true` while the channel is open.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Closes the channel.
    pub async fn finish(&self) {
        self.channel.disconnect().await;
        tracing::info!("show finished");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};
    use troupe_protocol::impl_command;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tick(u32);
    impl_command!(Tick, "test::Tick");

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tock(u32);
    impl_command!(Tock, "test::Tock");

    #[test]
    fn test_route_returns_follow_up_command() {
        let dispatchers = Dispatchers::default();
        dispatchers.insert(|tick: Tick| (tick.0 < 3).then(|| Tock(tick.0 + 1)));

        let next = dispatchers
            .route(&Message::command(&Tick(1)).unwrap())
            .unwrap();
        let tock: Tock = next.open_command().unwrap().decode().unwrap();
        assert_eq!(tock, Tock(2));

        assert!(dispatchers.route(&Message::command(&Tick(3)).unwrap()).is_none());
    }

    #[test]
    fn test_route_drops_unknown_kind() {
        let seen = Arc::new(AtomicU32::new(0));
        let dispatchers = Dispatchers::default();
        let counter = Arc::clone(&seen);
        dispatchers.insert(move |_tick: Tick| {
            counter.fetch_add(1, Ordering::SeqCst);
            None::<Tock>
        });

        assert!(dispatchers.route(&Message::command(&Tock(1)).unwrap()).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_route_survives_panicking_dispatcher() {
        let dispatchers = Dispatchers::default();
        dispatchers.insert(|_tick: Tick| -> Option<Tock> { panic!("missed cue") });
        assert!(dispatchers.route(&Message::command(&Tick(0)).unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let result = Puppeteer::connect_with(
            "127.0.0.1:1",
            ConnectionConfig {
                connect_timeout: std::time::Duration::from_millis(500),
                ..ConnectionConfig::default()
            },
        )
        .await;
        assert!(matches!(result, Err(TroupeError::Transport(_))));
    }
}
