//! Message type registry.
//!
//! Maps the wire-level type name carried in the `MessageType` header to the
//! concrete Rust type that decodes the payload. Built once at startup and
//! shared read-only (behind an `Arc`) by publishers and subscribers.
//!
//! Two ways to populate it:
//! - explicitly, with [`RegistryBuilder::register`];
//! - by collecting every type announced with [`register_message!`] anywhere in
//!   the final binary, with [`MessageTypeRegistry::from_inventory`].

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::message::{AnyMessage, Message, MessageKind};

/// Errors raised while building a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Message type name '{name}' is registered by both {existing} and {duplicate}")]
    DuplicateTypeName {
        name: String,
        existing: &'static str,
        duplicate: &'static str,
    },
}

type DecodeFn = fn(&[u8]) -> serde_json::Result<Box<dyn AnyMessage>>;

/// Everything the subscriber needs to know about a registered type.
#[derive(Clone, Copy)]
pub struct MessageDescriptor {
    name: &'static str,
    kind: MessageKind,
    type_id: TypeId,
    rust_type: &'static str,
    decode: DecodeFn,
}

impl MessageDescriptor {
    /// Descriptor for the concrete message type `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            name: M::TYPE_NAME,
            kind: M::KIND,
            type_id: TypeId::of::<M>(),
            rust_type: std::any::type_name::<M>(),
            decode: decode_boxed::<M>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Decode a wire payload into the described type.
    pub fn decode(&self, payload: &[u8]) -> serde_json::Result<Box<dyn AnyMessage>> {
        (self.decode)(payload)
    }
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rust_type", &self.rust_type)
            .finish()
    }
}

fn decode_boxed<M: Message>(payload: &[u8]) -> serde_json::Result<Box<dyn AnyMessage>> {
    let message: M = crate::message::decode(payload)?;
    Ok(Box::new(message))
}

/// Link-time registration record produced by [`register_message!`].
pub struct MessageRegistration {
    descriptor: fn() -> MessageDescriptor,
}

impl MessageRegistration {
    #[doc(hidden)]
    pub const fn new(descriptor: fn() -> MessageDescriptor) -> Self {
        Self { descriptor }
    }
}

inventory::collect!(MessageRegistration);

/// Announce a message type so that [`MessageTypeRegistry::from_inventory`]
/// picks it up.
///
/// ```ignore
/// bitlet::register_message!(ExampleModelCreated);
/// ```
#[macro_export]
macro_rules! register_message {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::registry::MessageRegistration::new(
                $crate::registry::MessageDescriptor::of::<$ty>
            )
        }
    };
}

/// Read-only mapping from type name to [`MessageDescriptor`].
#[derive(Debug, Default)]
pub struct MessageTypeRegistry {
    by_name: HashMap<&'static str, MessageDescriptor>,
}

impl MessageTypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a registry from every type announced with [`register_message!`].
    pub fn from_inventory() -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        for registration in inventory::iter::<MessageRegistration> {
            builder = builder.add((registration.descriptor)())?;
        }
        Ok(builder.build())
    }

    /// Look up a type by its wire name.
    ///
    /// Unknown names are expected (other producers may share the exchange),
    /// so this returns `None` rather than an error.
    pub fn lookup(&self, name: &str) -> Option<&MessageDescriptor> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered names, sorted.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Collects descriptors and rejects name collisions.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    by_name: HashMap<&'static str, MessageDescriptor>,
}

impl RegistryBuilder {
    /// Register the concrete message type `M`.
    pub fn register<M: Message>(self) -> Result<Self, RegistryError> {
        self.add(MessageDescriptor::of::<M>())
    }

    /// Register a descriptor.
    ///
    /// Adding the same Rust type twice is a no-op; a different type under an
    /// already used name is an error.
    pub fn add(mut self, descriptor: MessageDescriptor) -> Result<Self, RegistryError> {
        if let Some(existing) = self.by_name.get(descriptor.name) {
            if existing.type_id == descriptor.type_id {
                return Ok(self);
            }
            return Err(RegistryError::DuplicateTypeName {
                name: descriptor.name.to_string(),
                existing: existing.rust_type,
                duplicate: descriptor.rust_type,
            });
        }

        debug!(
            message_type = descriptor.name,
            kind = %descriptor.kind,
            "Registered message type"
        );
        self.by_name.insert(descriptor.name, descriptor);
        Ok(self)
    }

    pub fn build(self) -> MessageTypeRegistry {
        MessageTypeRegistry {
            by_name: self.by_name,
        }
    }
}
