//! Message bus: publishing and consuming typed messages through a broker.
//!
//! This module contains:
//! - `Transport` / `Connection` traits: the seam to the broker client
//! - `Delivery` / `Acker`: an inbound message and its settlement handle
//! - `Publisher`: lazy-connecting, type-tagging message publisher
//! - `Subscriber`: topology declaration, consume loop and ack/nack decisions
//! - `Dispatcher`: static message-type to handler table
//! - Implementations: AMQP (RabbitMQ), in-memory channel broker

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConnectionConfig;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod dispatch;
pub mod publisher;
pub mod subscriber;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use channel::{ChannelBroker, ChannelTransport};
pub use dispatch::{DispatchError, Dispatched, Dispatcher, HandlerError};
pub use publisher::Publisher;
pub use subscriber::{DeliveryOutcome, RunningSubscriber, Subscriber, SubscriberState};

/// Header carrying the message type name on every delivery.
pub const MESSAGE_TYPE_HEADER: &str = "MessageType";

/// Consumer tag used when the subscriber registers with the broker.
pub const CONSUMER_TAG: &str = "bitlet-subscriber";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("Publisher not ready: no broker connection is established")]
    PublisherNotReady,

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not connect to broker after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<BusError>,
    },

    #[error("Connection closed")]
    Closed,
}

impl From<crate::utils::retry::RetryError<BusError>> for BusError {
    fn from(err: crate::utils::retry::RetryError<BusError>) -> Self {
        BusError::RetriesExhausted {
            attempts: err.attempts,
            last: Box::new(err.last),
        }
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// A serialized message ready to be emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Value of the `MessageType` header.
    pub message_type: String,
    /// UTF-8 JSON payload.
    pub payload: Vec<u8>,
}

/// Stream of deliveries produced by [`Connection::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection (and its channel) to the broker described by `config`.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection>;
}

/// One broker connection with a single channel, owned exclusively by a
/// publisher or a subscriber.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Declare a durable, non-auto-deleted fanout exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable, non-exclusive, non-auto-deleted queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish best-effort (non-mandatory) with the type header attached.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Cancel a consumer started with [`Connection::consume`].
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close channel and connection. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Remove from the queue.
    Ack,
    /// Negative acknowledgement, optionally putting it back for redelivery.
    Reject { requeue: bool },
}

/// An inbound message awaiting settlement.
pub struct Delivery {
    /// Value of the `MessageType` header, if present and textual.
    pub message_type: Option<String>,
    pub payload: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        message_type: Option<String>,
        payload: Vec<u8>,
        redelivered: bool,
        acker: impl Acker + 'static,
    ) -> Self {
        Self {
            message_type,
            payload,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub async fn settle(&self, acknowledgement: Acknowledgement) -> Result<()> {
        match acknowledgement {
            Acknowledgement::Ack => self.acker.ack().await,
            Acknowledgement::Reject { requeue } => self.acker.reject(requeue).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_type", &self.message_type)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
