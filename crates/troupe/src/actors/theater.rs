//! Server-side command router.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use troupe_protocol::{ClientId, Command, Message, ServerResponse};

use super::{Actor, ErasedActor, TypedActor};
use crate::{SafeServer, SecureConfig, Server, ServerConfig, ServerHandler, TroupeError};

/// Routes each incoming command to the actor registered for its kind and
/// replies to the sender with the actor's answer.
///
/// Anything that can't be answered (unknown kind, undecodable body, actor
/// returning `None` or panicking) is acknowledged with nothing; the
/// session always stays open.
///
/// Cloning is cheap and clones share the actor table.
///
/// # Example
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use troupe::{ClientId, Theater, impl_command};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
/// impl_command!(Ping, "ping");
///
/// #[derive(Serialize, Deserialize)]
/// struct Pong;
/// impl_command!(Pong, "pong");
///
/// let theater = Theater::new();
/// theater.register_actor(|_client: &ClientId, _ping: Ping| Some(Pong));
/// assert!(theater.has_actor::<Ping>());
/// ```
#[derive(Clone, Default)]
pub struct Theater {
    actors: Arc<DashMap<&'static str, Arc<dyn ErasedActor>>>,
}

impl Theater {
    /// Creates a theater with no actors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `actor` for commands of kind `T::KIND`, replacing any
    /// previous actor for that kind.
    pub fn register_actor<T, A>(&self, actor: A)
    where
        T: Command,
        A: Actor<T>,
    {
        let erased: Arc<dyn ErasedActor> = Arc::new(TypedActor {
            actor,
            _command: PhantomData::<fn(T)>,
        });
        if self.actors.insert(T::KIND, erased).is_some() {
            tracing::debug!(kind = T::KIND, "actor replaced");
        }
    }

    /// Builder form of [`register_actor`](Self::register_actor).
    pub fn with_actor<T, A>(self, actor: A) -> Self
    where
        T: Command,
        A: Actor<T>,
    {
        self.register_actor(actor);
        self
    }

    /// `true` if an actor handles `T`.
    pub fn has_actor<T: Command>(&self) -> bool {
        self.actors.contains_key(T::KIND)
    }

    /// Runs the matching actor for one message and returns its encoded
    /// answer, if any.
    pub fn perform(&self, client: &ClientId, message: &Message) -> Option<Message> {
        let command = match message.open_command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(%client, error = %e, "not a command; ignoring");
                return None;
            }
        };
        let Some(actor) = self.actors.get(command.kind()).map(|entry| Arc::clone(entry.value()))
        else {
            tracing::warn!(%client, kind = command.kind(), "no actor for command");
            return None;
        };

        let kind = command.kind().to_string();
        match actor.react(client, command) {
            Ok(reply) => reply,
            Err(miss) => {
                tracing::error!(%client, %kind, error = %miss, "actor gave no answer");
                None
            }
        }
    }

    /// Binds a plain server that runs this theater.
    pub async fn bind(self, addr: &str) -> Result<Server<Theater>, TroupeError> {
        Server::bind(addr, self).await
    }

    /// Binds a secure server that runs this theater.
    pub async fn bind_secure(
        self,
        addr: &str,
        config: ServerConfig,
        secure: SecureConfig,
    ) -> Result<SafeServer<Theater>, TroupeError> {
        SafeServer::bind_with(addr, config, secure, self).await
    }
}

impl ServerHandler for Theater {
    async fn on_receive(&self, client: &ClientId, message: Message) -> Option<ServerResponse> {
        Some(match self.perform(client, &message) {
            Some(reply) => ServerResponse::reply(reply),
            None => ServerResponse::nothing(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use troupe_protocol::impl_command;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ask {
        n: u32,
    }
    impl_command!(Ask, "test::Ask");

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Answer {
        n: u32,
    }
    impl_command!(Answer, "test::Answer");

    /// Same shape as `Ask`, different kind.
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LoudAsk {
        n: u32,
    }
    impl_command!(LoudAsk, "test::LoudAsk");

    fn client() -> ClientId {
        ClientId::new("c1")
    }

    fn doubling() -> Theater {
        let theater = Theater::new();
        theater.register_actor(|_client: &ClientId, ask: Ask| Some(Answer { n: ask.n * 2 }));
        theater
    }

    // =====================================================================
    // perform()
    // =====================================================================

    #[test]
    fn test_perform_routes_to_registered_actor() {
        let reply = doubling()
            .perform(&client(), &Message::command(&Ask { n: 21 }).unwrap())
            .unwrap();
        let answer: Answer = reply.open_command().unwrap().decode().unwrap();
        assert_eq!(answer, Answer { n: 42 });
    }

    #[test]
    fn test_perform_matches_exact_kind_only() {
        let theater = doubling();
        let reply = theater.perform(&client(), &Message::command(&LoudAsk { n: 1 }).unwrap());
        assert!(reply.is_none());
    }

    #[test]
    fn test_perform_ignores_non_command_payload() {
        assert!(doubling().perform(&client(), &Message::from_text("hello")).is_none());
    }

    #[test]
    fn test_perform_survives_panicking_actor() {
        let theater = Theater::new();
        theater.register_actor(|_client: &ClientId, _ask: Ask| -> Option<Answer> {
            panic!("stage fright")
        });
        assert!(theater.perform(&client(), &Message::command(&Ask { n: 1 }).unwrap()).is_none());
    }

    #[test]
    fn test_register_replaces_previous_actor() {
        let theater = doubling();
        theater.register_actor(|_client: &ClientId, ask: Ask| Some(Answer { n: ask.n + 1 }));
        let reply = theater
            .perform(&client(), &Message::command(&Ask { n: 1 }).unwrap())
            .unwrap();
        let answer: Answer = reply.open_command().unwrap().decode().unwrap();
        assert_eq!(answer.n, 2);
    }

    #[test]
    fn test_actor_sees_sender_id() {
        let theater = Theater::new().with_actor(|client: &ClientId, _ask: Ask| {
            Some(Answer { n: client.as_str().len() as u32 })
        });
        let reply = theater
            .perform(&ClientId::new("abcd"), &Message::command(&Ask { n: 0 }).unwrap())
            .unwrap();
        let answer: Answer = reply.open_command().unwrap().decode().unwrap();
        assert_eq!(answer.n, 4);
    }

    // =====================================================================
    // ServerHandler
    // =====================================================================

    #[tokio::test]
    async fn test_on_receive_never_closes_session() {
        let theater = Theater::new();
        let response = theater
            .on_receive(&client(), Message::command(&Ask { n: 1 }).unwrap())
            .await
            .expect("router never ends the session");
        assert!(response.message().is_none());
    }

    #[tokio::test]
    async fn test_on_receive_replies_to_sender() {
        let response = doubling()
            .on_receive(&client(), Message::command(&Ask { n: 2 }).unwrap())
            .await
            .unwrap();
        assert_eq!(response.recipient(), &troupe_protocol::Recipient::Sender);
        assert!(response.message().is_some());
    }
}
