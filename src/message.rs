//! Message model shared by every event and command on the wire.
//!
//! A message is a plain serde struct carrying a [`MessageId`] plus a
//! purpose-specific payload. The wire payload is UTF-8 JSON whose field names
//! are the struct's field names; the concrete type travels separately in the
//! `MessageType` header (see [`crate::bus::MESSAGE_TYPE_HEADER`]).

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique message identifier.
///
/// Assigned exactly once when the message is created and never changed.
/// Used for traceability only, not for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The two families of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Something that happened.
    Event,
    /// A request for something to happen.
    Command,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => f.write_str("event"),
            Self::Command => f.write_str("command"),
        }
    }
}

/// A concrete, wire-level message type.
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct ExampleModelCreated {
///     id: MessageId,
///     model_id: Uuid,
/// }
///
/// impl Message for ExampleModelCreated {
///     const TYPE_NAME: &'static str = "ExampleModelCreated";
///     const KIND: MessageKind = MessageKind::Event;
///
///     fn id(&self) -> MessageId {
///         self.id
///     }
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Simple type name written to the `MessageType` header.
    ///
    /// Must be unique among the types registered in one
    /// [`MessageTypeRegistry`](crate::registry::MessageTypeRegistry).
    const TYPE_NAME: &'static str;

    /// Whether this is an event or a command.
    const KIND: MessageKind;

    /// Identifier assigned at construction.
    fn id(&self) -> MessageId;
}

/// Object-safe view of a decoded message whose concrete type is only known
/// at runtime.
pub trait AnyMessage: fmt::Debug + Send + Sync + 'static {
    fn message_id(&self) -> MessageId;
    fn message_type(&self) -> &'static str;
    fn message_kind(&self) -> MessageKind;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<M: Message> AnyMessage for M {
    fn message_id(&self) -> MessageId {
        self.id()
    }

    fn message_type(&self) -> &'static str {
        M::TYPE_NAME
    }

    fn message_kind(&self) -> MessageKind {
        M::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn AnyMessage {
    /// Whether the concrete type behind this message is `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.as_any().is::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    /// Recover the concrete message, or `None` if it is not an `M`.
    pub fn downcast<M: Message>(self: Box<Self>) -> Option<Box<M>> {
        self.into_any().downcast::<M>().ok()
    }
}

/// Serialize a message into its UTF-8 JSON wire payload.
pub fn encode<M: Message>(message: &M) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

/// Parse a wire payload into a concrete message.
pub fn decode<M: Message>(payload: &[u8]) -> serde_json::Result<M> {
    serde_json::from_slice(payload)
}
