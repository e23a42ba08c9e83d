//! Example service: projects `ExampleModelCreated` events into a read model.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bitlet::bus::dispatch::HandlerResult;
use bitlet::{DispatchError, Dispatcher, Message, MessageId, MessageKind};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// A model was created upstream.
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

/// Read-model row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleModel {
    pub id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Model store lock poisoned")]
    Poisoned,
}

/// In-memory read model. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    models: Arc<RwLock<HashMap<Uuid, ExampleModel>>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `model`. Returns false if a model with the same id exists.
    pub fn insert(&self, model: ExampleModel) -> Result<bool, StoreError> {
        let mut models = self.models.write().map_err(|_| StoreError::Poisoned)?;
        if models.contains_key(&model.id) {
            return Ok(false);
        }
        models.insert(model.id, model);
        Ok(true)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ExampleModel>, StoreError> {
        let models = self.models.read().map_err(|_| StoreError::Poisoned)?;
        Ok(models.get(&id).cloned())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let models = self.models.read().map_err(|_| StoreError::Poisoned)?;
        Ok(models.len())
    }
}

/// Project a created model. Redeliveries of an already projected event
/// still count as processed.
pub fn on_model_created(event: ExampleModelCreated, store: ModelStore) -> HandlerResult {
    let inserted = store.insert(ExampleModel { id: event.model_id })?;
    info!(model_id = %event.model_id, inserted, "Projected ExampleModelCreated");
    Ok(true)
}

/// Handlers of the example service.
pub fn dispatcher() -> Result<Dispatcher<ModelStore>, DispatchError> {
    Dispatcher::new().on_sync(on_model_created)
}
