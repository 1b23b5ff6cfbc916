//! Kind-tagged commands for type-routed dispatch.
//!
//! A router needs to know what a payload *is* before it can decode it. Every
//! routable type therefore declares a stable [`Command::KIND`] string, and
//! [`Message::command`] writes that kind next to the body:
//!
//! ```text
//! { "kind": "my_app::Ping", "body": { ... } }
//! ```
//!
//! Routing compares kinds for exact equality. A wrapper or "subtype" of a
//! command is a different kind and never reaches the handler registered for the inner type.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Message, ProtocolError};

/// A payload type that can be routed by kind.
///
/// Implement it by hand or with [`impl_command!`](crate::impl_command).
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier written on the wire. Must be unique per type
    /// within one application.
    const KIND: &'static str;
}

/// Implements [`Command`] for a type.
///
/// With one argument the kind is `module_path!()::TypeName`; a second
/// argument sets it explicitly.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use troupe_protocol::{Command, impl_command};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
/// impl_command!(Ping, "ping");
///
/// assert_eq!(<Ping as Command>::KIND, "ping");
/// ```
#[macro_export]
macro_rules! impl_command {
    ($ty:ty) => {
        impl $crate::Command for $ty {
            const KIND: &'static str =
                concat!(module_path!(), "::", stringify!($ty));
        }
    };
    ($ty:ty, $kind:expr) => {
        impl $crate::Command for $ty {
            const KIND: &'static str = $kind;
        }
    };
}

#[derive(Serialize)]
struct TaggedRef<'a, T> {
    kind: &'a str,
    body: &'a T,
}

/// A decoded command header whose body has not been interpreted yet.
#[derive(Debug, Clone, Deserialize)]
pub struct TaggedCommand {
    kind: String,
    body: serde_json::Value,
}

impl TaggedCommand {
    /// The sender's declared kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// `true` if this command carries a `T`.
    pub fn is<T: Command>(&self) -> bool {
        self.kind == T::KIND
    }

    /// Decodes the body as `T`.
    ///
    /// # Errors
    /// `InvalidMessage` if the kind isn't `T::KIND`, `Decode` if the body
    /// doesn't fit `T`.
    pub fn decode<T: Command>(self) -> Result<T, ProtocolError> {
        if !self.is::<T>() {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected kind {}, got {}",
                T::KIND,
                self.kind
            )));
        }
        serde_json::from_value(self.body).map_err(ProtocolError::Decode)
    }
}

impl Message {
    /// Wraps a command together with its kind.
    pub fn command<T: Command>(value: &T) -> Result<Self, ProtocolError> {
        Self::wrap(&TaggedRef {
            kind: T::KIND,
            body: value,
        })
    }

    /// Reads the kind header of a message built by [`Message::command`].
    pub fn open_command(&self) -> Result<TaggedCommand, ProtocolError> {
        self.unwrap()
    }
}
