//! Shared utilities for integration tests.
//!
//! Message types, an in-memory read model and broker helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitlet::bus::{ChannelBroker, ChannelTransport, Publisher, Subscriber};
use bitlet::config::{ConnectionConfig, SubscriberConfig};
use bitlet::registry::MessageTypeRegistry;
use bitlet::utils::retry::RetryPolicy;
use bitlet::{Dispatcher, Message, MessageId, MessageKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exchange every test publishes to.
pub const EXCHANGE: &str = "example-models";
/// Queue of the read-model subscriber.
pub const QUEUE: &str = "example-model-reader";
/// Upper bound for waiting on settlements.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleModelCreated {
    pub id: MessageId,
    pub model_id: Uuid,
}

impl ExampleModelCreated {
    pub fn new(model_id: Uuid) -> Self {
        Self {
            id: MessageId::new(),
            model_id,
        }
    }
}

impl Message for ExampleModelCreated {
    const TYPE_NAME: &'static str = "ExampleModelCreated";
    const KIND: MessageKind = MessageKind::Event;

    fn id(&self) -> MessageId {
        self.id
    }
}

bitlet::register_message!(ExampleModelCreated);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleModelArchived {
    pub id: MessageId,
    pub model_id: Uuid,
}

impl ExampleModelArchived {
    pub fn new(model_id: Uuid) -> Self {
        Self {
            id: MessageId::new(),
            model_id,
        }
    }
}

impl Message for ExampleModelArchived {
    const TYPE_NAME: &'static str = "ExampleModelArchived";
    const KIND: MessageKind = MessageKind::Event;

    fn id(&self) -> MessageId {
        self.id
    }
}

bitlet::register_message!(ExampleModelArchived);

/// Read-model row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleModel {
    pub id: Uuid,
}

/// In-memory read model shared with handlers.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    models: Arc<Mutex<HashMap<Uuid, ExampleModel>>>,
}

impl ModelStore {
    pub fn insert(&self, model: ExampleModel) {
        self.models.lock().unwrap().insert(model.id, model);
    }

    pub fn get(&self, id: Uuid) -> Option<ExampleModel> {
        self.models.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.lock().unwrap().len()
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new("localhost", "guest", "guest", EXCHANGE).expect("valid connection config")
}

pub fn subscriber_config() -> SubscriberConfig {
    SubscriberConfig::new(connection_config(), QUEUE).expect("valid subscriber config")
}

/// Retry policy with the production attempt budget and no waiting.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(9, Duration::from_millis(1))
}

pub fn registry() -> Arc<MessageTypeRegistry> {
    Arc::new(
        MessageTypeRegistry::builder()
            .register::<ExampleModelCreated>()
            .and_then(|b| b.register::<ExampleModelArchived>())
            .expect("distinct type names")
            .build(),
    )
}

pub fn publisher(broker: &ChannelBroker) -> Publisher<ChannelTransport> {
    Publisher::new(ChannelTransport::new(broker.clone()), connection_config()).with_retry_policy(fast_retry())
}

pub fn subscriber<S>(broker: &ChannelBroker, dispatcher: Dispatcher<S>, context: S) -> Subscriber<ChannelTransport, S>
where
    S: Clone + Send + Sync + 'static,
{
    Subscriber::new(
        ChannelTransport::new(broker.clone()),
        subscriber_config(),
        registry(),
        dispatcher,
        context,
    )
    .with_retry_policy(fast_retry())
}

/// Dispatcher projecting `ExampleModelCreated` into a [`ModelStore`].
pub fn projection() -> Dispatcher<ModelStore> {
    Dispatcher::new()
        .on_sync(|event: ExampleModelCreated, store: ModelStore| {
            store.insert(ExampleModel { id: event.model_id });
            Ok(true)
        })
        .expect("single handler")
}
