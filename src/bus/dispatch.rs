//! Handler dispatch.
//!
//! A [`Dispatcher`] is a table from message type to handler function, built
//! once at startup. Each handler receives the decoded message plus a clone of
//! the dispatcher's context value `S` (database pool, repositories, ...), and
//! answers whether the message was processed.
//!
//! Resolution is deterministic, most specific first:
//! 1. a handler registered for the message's concrete type ([`Dispatcher::on`]),
//! 2. a handler for its kind, event or command ([`Dispatcher::on_kind`]),
//! 3. the catch-all handler ([`Dispatcher::on_any`]).
//!
//! Two handlers at the same level for the same target are rejected when the
//! table is built.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new()
//!     .on(|event: ExampleModelCreated, store: ModelStore| async move {
//!         store.insert(event.model_id).await?;
//!         Ok(true)
//!     })?
//!     .on_sync(|_: ExampleModelRenamed, _| Ok(false))?;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::message::{AnyMessage, Message, MessageKind};

/// Error raised by a handler. Treated as transient by the subscriber.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler: `Ok(true)` processed, `Ok(false)` declined.
pub type HandlerResult = std::result::Result<bool, HandlerError>;

type BoxedHandler<S> = Arc<dyn Fn(Box<dyn AnyMessage>, S) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Errors raised while building a dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("A handler for {target} is already registered")]
    DuplicateHandler { target: String },
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran and returned this outcome.
    Handled(bool),
    /// No handler accepts the message.
    Unhandled,
}

struct Route<S> {
    target: String,
    handler: BoxedHandler<S>,
}

impl<S> Clone for Route<S> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Static table from message type to handler.
pub struct Dispatcher<S = ()> {
    exact: HashMap<TypeId, Route<S>>,
    by_kind: HashMap<MessageKind, Route<S>>,
    fallback: Option<Route<S>>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            by_kind: HashMap::new(),
            fallback: None,
        }
    }
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            exact: self.exact.clone(),
            by_kind: self.by_kind.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<S> Dispatcher<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for the concrete message type `M`.
    pub fn on<M, F, Fut>(mut self, handler: F) -> Result<Self, DispatchError>
    where
        M: Message,
        F: Fn(M, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let type_id = TypeId::of::<M>();
        if self.exact.contains_key(&type_id) {
            return Err(DispatchError::DuplicateHandler {
                target: M::TYPE_NAME.to_string(),
            });
        }

        let handler: BoxedHandler<S> = Arc::new(
            move |message: Box<dyn AnyMessage>, state: S| -> BoxFuture<'static, HandlerResult> {
                match message.downcast::<M>() {
                    Some(message) => handler(*message, state).boxed(),
                    None => {
                        let reason = format!("Handler for {} received another message type", M::TYPE_NAME);
                        futures::future::ready(Err(reason.into())).boxed()
                    }
                }
            },
        );

        self.exact.insert(
            type_id,
            Route {
                target: M::TYPE_NAME.to_string(),
                handler,
            },
        );
        Ok(self)
    }

    /// Register a synchronous handler for the concrete message type `M`.
    pub fn on_sync<M, F>(self, handler: F) -> Result<Self, DispatchError>
    where
        M: Message,
        F: Fn(M, S) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(move |message: M, state: S| futures::future::ready(handler(message, state)))
    }

    /// Register a handler for every message of `kind` without a more specific
    /// handler.
    pub fn on_kind<F, Fut>(mut self, kind: MessageKind, handler: F) -> Result<Self, DispatchError>
    where
        F: Fn(Box<dyn AnyMessage>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.by_kind.contains_key(&kind) {
            return Err(DispatchError::DuplicateHandler {
                target: format!("every {}", kind),
            });
        }
        self.by_kind.insert(
            kind,
            Route {
                target: format!("every {}", kind),
                handler: Arc::new(
                    move |message: Box<dyn AnyMessage>, state: S| -> BoxFuture<'static, HandlerResult> {
                        handler(message, state).boxed()
                    },
                ),
            },
        );
        Ok(self)
    }

    /// Register the handler used when nothing more specific matches.
    pub fn on_any<F, Fut>(mut self, handler: F) -> Result<Self, DispatchError>
    where
        F: Fn(Box<dyn AnyMessage>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.fallback.is_some() {
            return Err(DispatchError::DuplicateHandler {
                target: "any message".to_string(),
            });
        }
        self.fallback = Some(Route {
            target: "any message".to_string(),
            handler: Arc::new(
                move |message: Box<dyn AnyMessage>, state: S| -> BoxFuture<'static, HandlerResult> {
                    handler(message, state).boxed()
                },
            ),
        });
        Ok(self)
    }

    fn resolve(&self, message: &dyn AnyMessage) -> Option<&Route<S>> {
        self.exact
            .get(&message.as_any().type_id())
            .or_else(|| self.by_kind.get(&message.message_kind()))
            .or(self.fallback.as_ref())
    }

    /// Whether some handler would accept `message`.
    pub fn handles(&self, message: &dyn AnyMessage) -> bool {
        self.resolve(message).is_some()
    }

    /// Invoke the handler selected for `message`.
    ///
    /// Handler errors are returned unchanged.
    pub async fn dispatch(
        &self,
        message: Box<dyn AnyMessage>,
        state: S,
    ) -> Result<Dispatched, HandlerError> {
        let Some(route) = self.resolve(message.as_ref()) else {
            return Ok(Dispatched::Unhandled);
        };

        debug!(
            message_type = message.message_type(),
            message_id = %message.message_id(),
            handler = %route.target,
            "Dispatching message"
        );
        let handler = Arc::clone(&route.handler);
        handler(message, state).await.map(Dispatched::Handled)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.exact.len() + self.by_kind.len() + usize::from(self.fallback.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut targets: Vec<&str> = self
            .exact
            .values()
            .chain(self.by_kind.values())
            .chain(self.fallback.iter())
            .map(|r| r.target.as_str())
            .collect();
        targets.sort_unstable();
        f.debug_struct("Dispatcher").field("handlers", &targets).finish()
    }
}
