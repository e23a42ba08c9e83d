//! Test messages and helpers shared by unit tests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, MessageId, MessageKind};
use crate::registry::MessageTypeRegistry;

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleModelRenamed {
    pub id: MessageId,
    pub model_id: Uuid,
    pub name: String,
}

impl ExampleModelRenamed {
    pub fn new(model_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            model_id,
            name: name.into(),
        }
    }
}

impl Message for ExampleModelRenamed {
    const TYPE_NAME: &'static str = "ExampleModelRenamed";
    const KIND: MessageKind = MessageKind::Event;

    fn id(&self) -> MessageId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExampleModel {
    pub id: MessageId,
    pub model_id: Uuid,
}

impl CreateExampleModel {
    pub fn new(model_id: Uuid) -> Self {
        Self {
            id: MessageId::new(),
            model_id,
        }
    }
}

impl Message for CreateExampleModel {
    const TYPE_NAME: &'static str = "CreateExampleModel";
    const KIND: MessageKind = MessageKind::Command;

    fn id(&self) -> MessageId {
        self.id
    }
}

/// Registry containing every test message type.
pub fn test_registry() -> MessageTypeRegistry {
    MessageTypeRegistry::builder()
        .register::<ExampleModelCreated>()
        .and_then(|b| b.register::<ExampleModelRenamed>())
        .and_then(|b| b.register::<CreateExampleModel>())
        .expect("test message names are unique")
        .build()
}
