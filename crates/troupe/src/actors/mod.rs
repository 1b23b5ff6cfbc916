//! Type-routed request/reply on top of the plain or secure channel.
//!
//! Payloads are [`Command`]s: serializable types with a stable kind. The
//! server side is a [`Theater`] holding one [`Actor`] per command kind;
//! the client side is a [`Puppeteer`] holding one [`Dispatcher`] per reply
//! kind.
//!
//! ```text
//! Puppeteer ──give_command(Ping)──→ Theater ──Actor<Ping>::react──→ Some(Pong)
//!     ↑                                                                 │
//!     └──Dispatcher<Pong>::dispatch──→ Some(Ping) / None ←──── reply ───┘
//! ```
//!
//! Routing is by exact kind. Handlers are stored type-erased in a map keyed
//! by [`Command::KIND`].

mod puppeteer;
mod theater;

pub use puppeteer::{Dispatchers, Puppeteer};
pub use theater::Theater;

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

use troupe_protocol::{ClientId, Command, Message, ProtocolError, TaggedCommand};

use crate::{ClientHandler, Connection, SafeConnection, TroupeError};

/// Server-side handler for one command type.
///
/// Closures `Fn(&ClientId, T) -> Option<R>` are actors too.
pub trait Actor<T: Command>: Send + Sync + 'static {
    /// What the actor answers with.
    type Reply: Command;

    /// Handles one command from `client`. `None` sends nothing back.
    fn react(&self, client: &ClientId, command: T) -> Option<Self::Reply>;
}

impl<T, R, F> Actor<T> for F
where
    T: Command,
    R: Command,
    F: Fn(&ClientId, T) -> Option<R> + Send + Sync + 'static,
{
    type Reply = R;

    fn react(&self, client: &ClientId, command: T) -> Option<R> {
        self(client, command)
    }
}

/// Client-side handler for one reply type.
///
/// Closures `Fn(T) -> Option<C>` are dispatchers too.
pub trait Dispatcher<T: Command>: Send + Sync + 'static {
    /// Follow-up command type.
    type Command: Command;

    /// Handles one reply. `Some` is sent to the server as the next command.
    fn dispatch(&self, reply: T) -> Option<Self::Command>;
}

impl<T, C, F> Dispatcher<T> for F
where
    T: Command,
    C: Command,
    F: Fn(T) -> Option<C> + Send + Sync + 'static,
{
    type Command = C;

    fn dispatch(&self, reply: T) -> Option<C> {
        self(reply)
    }
}

/// What a [`Puppeteer`] needs from its connection.
pub trait ClientChannel: Send + Sync + 'static {
    /// Opens the channel; a no-op when already open.
    fn connect(&self) -> impl Future<Output = Result<(), TroupeError>> + Send;

    /// Sends one message.
    fn send(&self, message: Message) -> impl Future<Output = Result<(), TroupeError>> + Send;

    /// Closes the channel.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// `true` while the channel is open.
    fn is_connected(&self) -> bool;
}

impl<H: ClientHandler> ClientChannel for Connection<H> {
    fn connect(&self) -> impl Future<Output = Result<(), TroupeError>> + Send {
        Connection::connect(self)
    }

    fn send(&self, message: Message) -> impl Future<Output = Result<(), TroupeError>> + Send {
        Connection::send(self, message)
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        Connection::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }
}

impl<H: ClientHandler> ClientChannel for SafeConnection<H> {
    fn connect(&self) -> impl Future<Output = Result<(), TroupeError>> + Send {
        SafeConnection::connect(self)
    }

    fn send(&self, message: Message) -> impl Future<Output = Result<(), TroupeError>> + Send {
        SafeConnection::send(self, message)
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        SafeConnection::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        SafeConnection::is_connected(self)
    }
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// Why a tagged command produced no answer.
#[derive(Debug, thiserror::Error)]
enum Miss {
    #[error("undecodable body: {0}")]
    Decode(ProtocolError),
    #[error("unencodable answer: {0}")]
    Encode(ProtocolError),
    #[error("handler panicked")]
    Panicked,
}

trait ErasedActor: Send + Sync {
    fn react(&self, client: &ClientId, command: TaggedCommand) -> Result<Option<Message>, Miss>;
}

struct TypedActor<T, A> {
    actor: A,
    _command: PhantomData<fn(T)>,
}

impl<T: Command, A: Actor<T>> ErasedActor for TypedActor<T, A> {
    fn react(&self, client: &ClientId, command: TaggedCommand) -> Result<Option<Message>, Miss> {
        let command = command.decode::<T>().map_err(Miss::Decode)?;
        let reply = catch_unwind(AssertUnwindSafe(|| self.actor.react(client, command)))
            .map_err(|_| Miss::Panicked)?;
        reply
            .map(|reply| Message::command(&reply))
            .transpose()
            .map_err(Miss::Encode)
    }
}

trait ErasedDispatcher: Send + Sync {
    fn dispatch(&self, reply: TaggedCommand) -> Result<Option<Message>, Miss>;
}

struct TypedDispatcher<T, D> {
    dispatcher: D,
    _reply: PhantomData<fn(T)>,
}

impl<T: Command, D: Dispatcher<T>> ErasedDispatcher for TypedDispatcher<T, D> {
    fn dispatch(&self, reply: TaggedCommand) -> Result<Option<Message>, Miss> {
        let reply = reply.decode::<T>().map_err(Miss::Decode)?;
        let next = catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(reply)))
            .map_err(|_| Miss::Panicked)?;
        next.map(|next| Message::command(&next))
            .transpose()
            .map_err(Miss::Encode)
    }
}
