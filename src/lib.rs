//! Bitlet - typed message bus over RabbitMQ
//!
//! Services publish typed events and commands to a fanout exchange and
//! consume them from durable queues. Each message carries its type name in a
//! `MessageType` header; subscribers resolve the name through a registry of
//! known types, decode the JSON payload and hand it to the handler
//! registered for that type. The handler's answer decides whether the
//! delivery is acknowledged, rejected or requeued.

pub mod bus;
pub mod config;
pub mod message;
pub mod registry;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

// Used by `register_message!`.
#[doc(hidden)]
pub use inventory;

// Re-export commonly used types
pub use bus::{
    BusError, DeliveryOutcome, DispatchError, Dispatched, Dispatcher, HandlerError, Publisher,
    RunningSubscriber, Subscriber, SubscriberState,
};
pub use config::{ConfigError, ConnectionConfig, Settings, SubscriberConfig};
pub use message::{AnyMessage, Message, MessageId, MessageKind};
pub use registry::{MessageDescriptor, MessageTypeRegistry, RegistryError};
