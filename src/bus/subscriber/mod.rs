//! Message subscriber.
//!
//! Declares the queue topology, consumes deliveries one at a time and settles
//! each one according to what happened to it:
//!
//! | Delivery                         | Outcome     | Settlement         |
//! |----------------------------------|-------------|--------------------|
//! | no `MessageType` header          | `Malformed` | reject             |
//! | type not in the registry         | `Foreign`   | ack                |
//! | payload does not decode          | `Malformed` | reject             |
//! | handler returned an error        | `Transient` | reject and requeue |
//! | handler returned `false`         | `Declined`  | reject             |
//! | no handler for the type          | `Unhandled` | reject             |
//! | handler returned `true`          | `Processed` | ack                |
//!
//! When the broker ends the delivery stream the subscriber reconnects under
//! the same retry policy as at start, and stops once that budget is spent.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{Dispatched, Dispatcher};
use super::{Acknowledgement, BusError, Connection, Delivery, DeliveryStream, Result, Transport, CONSUMER_TAG};
use crate::config::SubscriberConfig;
use crate::registry::MessageTypeRegistry;
use crate::utils::retry::RetryPolicy;

/// Lifecycle of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    /// Connection attempts in progress.
    Connecting,
    /// Exchange, queue and binding are in place.
    TopologyDeclared,
    Consuming,
    Stopped,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connecting => "connecting",
            SubscriberState::TopologyDeclared => "topology-declared",
            SubscriberState::Consuming => "consuming",
            SubscriberState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a delivery was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A handler processed the message.
    Processed,
    /// The type is not known to this service.
    Foreign,
    /// Missing type header or undecodable payload.
    Malformed,
    /// The handler failed; the message should be retried.
    Transient,
    /// The handler ran and declined the message.
    Declined,
    /// Known type without a handler.
    Unhandled,
}

impl DeliveryOutcome {
    pub fn acknowledgement(&self) -> Acknowledgement {
        match self {
            DeliveryOutcome::Processed | DeliveryOutcome::Foreign => Acknowledgement::Ack,
            DeliveryOutcome::Transient => Acknowledgement::Reject { requeue: true },
            DeliveryOutcome::Malformed | DeliveryOutcome::Declined | DeliveryOutcome::Unhandled => {
                Acknowledgement::Reject { requeue: false }
            }
        }
    }
}

/// Consumes one queue and hands decoded messages to a [`Dispatcher`].
pub struct Subscriber<T: Transport, S = ()> {
    transport: T,
    config: SubscriberConfig,
    registry: Arc<MessageTypeRegistry>,
    dispatcher: Dispatcher<S>,
    context: S,
    retry: RetryPolicy,
    state: watch::Sender<SubscriberState>,
}

#[cfg(feature = "amqp")]
impl<S> Subscriber<super::AmqpTransport, S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Subscriber backed by RabbitMQ.
    pub fn amqp(
        config: SubscriberConfig,
        registry: Arc<MessageTypeRegistry>,
        dispatcher: Dispatcher<S>,
        context: S,
    ) -> Self {
        Self::new(super::AmqpTransport::new(), config, registry, dispatcher, context)
    }
}

impl<T, S> Subscriber<T, S>
where
    T: Transport,
    S: Clone + Send + Sync + 'static,
{
    pub fn new(
        transport: T,
        config: SubscriberConfig,
        registry: Arc<MessageTypeRegistry>,
        dispatcher: Dispatcher<S>,
        context: S,
    ) -> Self {
        info!(
            config = ?config.connection(),
            queue = config.queue(),
            routing_key = config.routing_key(),
            "Creating subscriber"
        );
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            transport,
            config,
            registry,
            dispatcher,
            context,
            retry: RetryPolicy::connection(),
            state,
        }
    }

    /// Replace the connection retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Connect, declare topology and start consuming on a spawned task.
    ///
    /// Fails with [`BusError::RetriesExhausted`] when the broker stays
    /// unreachable for the whole retry budget.
    pub async fn start(self) -> Result<RunningSubscriber> {
        self.state.send_replace(SubscriberState::Connecting);

        let (connection, deliveries) = match self.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                self.state.send_replace(SubscriberState::Stopped);
                error!(queue = self.config.queue(), error = %e, "Subscriber failed to start");
                return Err(e);
            }
        };

        self.state.send_replace(SubscriberState::Consuming);
        info!(
            queue = self.config.queue(),
            exchange = self.config.exchange(),
            "Subscriber consuming"
        );

        let states = self.state.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.consume_loop(connection, deliveries, shutdown_rx));

        Ok(RunningSubscriber {
            states,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn connect(&self) -> Result<(T::Connection, DeliveryStream)> {
        let transport = &self.transport;
        let config = &self.config;
        let state = &self.state;

        let pair = self
            .retry
            .run("connect subscriber", move || async move {
                state.send_replace(SubscriberState::Connecting);
                let connection = transport.connect(config.connection()).await?;
                match Self::declare_and_consume(&connection, config, state).await {
                    Ok(deliveries) => Ok::<_, BusError>((connection, deliveries)),
                    Err(e) => {
                        if let Err(close_err) = connection.close().await {
                            warn!(error = %close_err, "Failed to close subscriber connection");
                        }
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(pair)
    }

    async fn declare_and_consume(
        connection: &T::Connection,
        config: &SubscriberConfig,
        state: &watch::Sender<SubscriberState>,
    ) -> Result<DeliveryStream> {
        connection.declare_exchange(config.exchange()).await?;
        connection.declare_queue(config.queue()).await?;
        connection
            .bind_queue(config.queue(), config.exchange(), config.routing_key())
            .await?;
        state.send_replace(SubscriberState::TopologyDeclared);
        debug!(
            queue = config.queue(),
            exchange = config.exchange(),
            routing_key = config.routing_key(),
            "Declared subscriber topology"
        );

        connection.consume(config.queue(), CONSUMER_TAG).await
    }

    async fn consume_loop(
        self,
        mut connection: T::Connection,
        mut deliveries: DeliveryStream,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = self.config.queue(), "Subscriber shutdown requested");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process_delivery(&delivery).await;
                    continue;
                }
                Some(Err(e)) => {
                    error!(queue = self.config.queue(), error = %e, "Delivery stream failed, reconnecting");
                }
                None => {
                    warn!(queue = self.config.queue(), "Delivery stream ended by broker, reconnecting");
                }
            }

            if let Err(e) = Self::disconnect(&connection).await {
                warn!(error = %e, "Failed to close lost subscriber connection");
            }

            let reconnected = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = self.config.queue(), "Subscriber shutdown requested while reconnecting");
                    self.state.send_replace(SubscriberState::Stopped);
                    return Ok(());
                }
                reconnected = self.connect() => reconnected,
            };

            match reconnected {
                Ok((new_connection, new_deliveries)) => {
                    connection = new_connection;
                    deliveries = new_deliveries;
                    self.state.send_replace(SubscriberState::Consuming);
                    info!(queue = self.config.queue(), "Subscriber reconnected");
                }
                Err(e) => {
                    self.state.send_replace(SubscriberState::Stopped);
                    error!(queue = self.config.queue(), error = %e, "Subscriber could not reconnect, stopping");
                    return Err(e);
                }
            }
        }

        drop(deliveries);
        let result = Self::disconnect(&connection).await;
        self.state.send_replace(SubscriberState::Stopped);
        info!(queue = self.config.queue(), "Subscriber stopped");
        result
    }

    async fn disconnect(connection: &T::Connection) -> Result<()> {
        if let Err(e) = connection.cancel(CONSUMER_TAG).await {
            warn!(error = %e, "Failed to cancel consumer");
        }
        connection.close().await
    }

    /// Classify and settle one delivery.
    ///
    /// Settlement failures are logged; the outcome is returned either way.
    pub async fn process_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let outcome = self.classify(delivery).await;
        let acknowledgement = outcome.acknowledgement();

        if let Err(e) = delivery.settle(acknowledgement).await {
            error!(
                message_type = delivery.message_type.as_deref().unwrap_or_default(),
                ?outcome,
                error = %e,
                "Failed to settle delivery"
            );
        }
        outcome
    }

    async fn classify(&self, delivery: &Delivery) -> DeliveryOutcome {
        let Some(message_type) = delivery.message_type.as_deref() else {
            warn!(queue = self.config.queue(), "Delivery has no MessageType header, rejecting");
            return DeliveryOutcome::Malformed;
        };

        let Some(descriptor) = self.registry.lookup(message_type) else {
            debug!(message_type, "Unknown message type, acknowledging without processing");
            return DeliveryOutcome::Foreign;
        };

        let message = match descriptor.decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_type, error = %e, "Failed to decode message, rejecting");
                return DeliveryOutcome::Malformed;
            }
        };
        let message_id = message.message_id();

        match self.dispatcher.dispatch(message, self.context.clone()).await {
            Ok(Dispatched::Handled(true)) => {
                debug!(message_type, %message_id, "Message processed");
                DeliveryOutcome::Processed
            }
            Ok(Dispatched::Handled(false)) => {
                warn!(message_type, %message_id, "Handler declined message, rejecting");
                DeliveryOutcome::Declined
            }
            Ok(Dispatched::Unhandled) => {
                warn!(message_type, %message_id, "No handler for message, rejecting");
                DeliveryOutcome::Unhandled
            }
            Err(e) => {
                error!(
                    message_type,
                    %message_id,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Handler failed, requeueing"
                );
                DeliveryOutcome::Transient
            }
        }
    }
}

/// Handle to a started subscriber.
///
/// Dropping the handle stops the consume loop after the current delivery.
pub struct RunningSubscriber {
    states: watch::Receiver<SubscriberState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningSubscriber {
    pub fn state(&self) -> SubscriberState {
        *self.states.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SubscriberState> {
        self.states.clone()
    }

    /// Whether the consume loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming: the in-flight delivery is settled first, then the
    /// consumer is cancelled and the connection closed.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already have exited on its own.
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Wait for the consume loop to exit on its own. That only happens when
    /// a lost connection could not be re-established within the retry budget,
    /// in which case the retry error is returned.
    pub async fn stopped(mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(BusError::Subscribe(format!("Consume loop aborted: {}", e))),
        }
    }
}

impl fmt::Debug for RunningSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSubscriber")
            .field("state", &self.state())
            .finish()
    }
}
