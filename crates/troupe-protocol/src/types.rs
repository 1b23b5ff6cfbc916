//! Core envelope types for troupe's wire format.
//!
//! A [`Message`] is what travels in one frame. A [`ServerResponse`] is what
//! a server-side handler hands back to say where (if anywhere) a reply
//! should go.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::compression::{compress, decompress};
use crate::{Codec, JsonCodec, ProtocolError};

/// Size of the timestamp header at the front of every frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Milliseconds since the Unix epoch, by the local wall clock.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ClientId
// ---------------------------------------------------------------------------

/// Identifies one connected client on the server.
///
/// Derived by the server from the socket identity at accept time, so it is
/// stable for the lifetime of a connection and different for every new one.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClientId(String);

impl ClientId {
    /// Wraps an already-derived identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One unit of data on the wire: a send timestamp plus an opaque payload.
///
/// The payload is usually a serialized-then-deflated value (see
/// [`Message::wrap`]), but raw bytes and text are carried as-is.
///
/// Two messages are equal when their payloads are byte-for-byte equal; the
/// timestamp is deliberately left out of equality and hashing.
#[derive(Debug, Clone)]
pub struct Message {
    timestamp: i64,
    payload: Bytes,
}

impl Message {
    /// Creates a message carrying `payload` verbatim, stamped with the
    /// current time.
    pub fn from_bytes(payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp: now_millis(),
            payload: payload.into(),
        }
    }

    /// Creates a message carrying the UTF-8 bytes of `text`.
    pub fn from_text(text: &str) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Creates a message with no payload. Transports refuse to send it.
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// Serializes `value` as JSON, deflates it, and wraps the result.
    ///
    /// ```rust
    /// use troupe_protocol::Message;
    ///
    /// let msg = Message::wrap(&("hello", 42)).unwrap();
    /// let back: (String, u32) = msg.unwrap().unwrap();
    /// assert_eq!(back, ("hello".to_string(), 42));
    /// ```
    pub fn wrap<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Self::wrap_with(&JsonCodec, value)
    }

    /// Like [`wrap`](Self::wrap), with an explicit codec.
    pub fn wrap_with<C: Codec, T: Serialize>(
        codec: &C,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let encoded = codec.encode(value)?;
        Ok(Self::from_bytes(compress(&encoded)?))
    }

    /// Inflates the payload and decodes it as JSON.
    ///
    /// Corrupt or foreign payloads are an error, never a panic.
    pub fn unwrap<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        self.unwrap_with(&JsonCodec)
    }

    /// Like [`unwrap`](Self::unwrap), with an explicit codec.
    pub fn unwrap_with<C: Codec, T: DeserializeOwned>(
        &self,
        codec: &C,
    ) -> Result<T, ProtocolError> {
        let decoded = decompress(&self.payload)?;
        codec.decode(&decoded)
    }

    /// Sender-side wall-clock time (ms since the Unix epoch).
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message, returning the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// `true` when there is no payload to send.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Encodes the message as one frame: `[timestamp i64 BE][payload]`.
    pub fn to_frame(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        frame.put_i64(self.timestamp);
        frame.put_slice(&self.payload);
        frame.freeze()
    }

    /// Decodes a frame produced by [`to_frame`](Self::to_frame).
    ///
    /// # Errors
    /// `ProtocolError::InvalidMessage` if the frame can't hold a timestamp.
    pub fn from_frame(mut frame: BytesMut) -> Result<Self, ProtocolError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::InvalidMessage(format!(
                "frame of {} bytes is shorter than the {FRAME_HEADER_LEN}-byte header",
                frame.len()
            )));
        }
        let timestamp = frame.get_i64();
        Ok(Self {
            timestamp,
            payload: frame.freeze(),
        })
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.hash(state);
    }
}

// ---------------------------------------------------------------------------
// ServerResponse
// ---------------------------------------------------------------------------

/// Who should receive a [`ServerResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// The client whose request produced this response.
    Sender,

    /// One specific client, which need not be the sender.
    Client(ClientId),

    /// Every client registered at delivery time.
    Broadcast,
}

/// What a server-side handler returns for one received message.
///
/// A response without a message is an acknowledgement: nothing is sent and
/// the session stays open. Closing the session is signalled one level up,
/// by the handler returning no response at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    message: Option<Message>,
    recipient: Recipient,
}

impl ServerResponse {
    /// Replies to the sender of the triggering request.
    pub fn reply(message: Message) -> Self {
        Self {
            message: Some(message),
            recipient: Recipient::Sender,
        }
    }

    /// Sends `message` to `client` only.
    pub fn to(client: ClientId, message: Message) -> Self {
        Self {
            message: Some(message),
            recipient: Recipient::Client(client),
        }
    }

    /// Sends `message` to every registered client.
    pub fn broadcast(message: Message) -> Self {
        Self {
            message: Some(message),
            recipient: Recipient::Broadcast,
        }
    }

    /// Acknowledges without sending anything.
    pub fn nothing() -> Self {
        Self {
            message: None,
            recipient: Recipient::Sender,
        }
    }

    /// The message to deliver, if any.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Where the message should go.
    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    /// `true` for broadcast responses.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.recipient, Recipient::Broadcast)
    }

    /// Splits the response into its message and recipient.
    pub fn into_parts(self) -> (Option<Message>, Recipient) {
        (self.message, self.recipient)
    }

    /// Same addressing, different message.
    pub fn with_message(self, message: Message) -> Self {
        Self {
            message: Some(message),
            recipient: self.recipient,
        }
    }
}

// ---------------------------------------------------------------------------
// Secure channel frames
// ---------------------------------------------------------------------------

/// A public key announcement, sent once in each direction during the
/// secure handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// PKCS#1 DER encoding of the sender's RSA public key.
    pub key: Vec<u8>,
    /// Largest plaintext block the sender can decrypt
    /// (`key_bits / 8 - 11` for PKCS#1 v1.5).
    pub block_size: usize,
}

/// An application message split into independently encrypted blocks.
///
/// Reassembly is concatenation in list order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafeMessage {
    pub blocks: Vec<Vec<u8>>,
}

/// What a plain [`Message`] carries on the secure channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SecureFrame {
    /// Handshake leg: the sender's public key.
    Key(EncryptionKey),
    /// An encrypted application message.
    Sealed(SafeMessage),
}

// =========================================================================
// Tests
// =========================================================================
