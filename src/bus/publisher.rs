//! Message publisher.
//!
//! Connects lazily on the first publish, tags every message with its type
//! name and emits it to the configured fanout exchange.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{BusError, Connection, OutboundMessage, Result, Transport};
use crate::config::ConnectionConfig;
use crate::message::{self, Message};
use crate::utils::retry::RetryPolicy;

/// Publishes typed messages to one exchange.
///
/// The broker connection is opened on first use and shared by every
/// subsequent publish until [`Publisher::close`]. A connection that fails a
/// publish is discarded and the next publish reconnects.
pub struct Publisher<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    retry: RetryPolicy,
    /// Serializes connection establishment.
    connect_gate: Mutex<()>,
    connection: RwLock<Option<Arc<T::Connection>>>,
}

#[cfg(feature = "amqp")]
impl Publisher<super::AmqpTransport> {
    /// Publisher backed by RabbitMQ.
    pub fn amqp(config: ConnectionConfig) -> Self {
        Self::new(super::AmqpTransport::new(), config)
    }
}

impl<T: Transport> Publisher<T> {
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        info!(config = ?config, "Creating publisher");
        Self {
            transport,
            config,
            retry: RetryPolicy::connection(),
            connect_gate: Mutex::new(()),
            connection: RwLock::new(None),
        }
    }

    /// Replace the connection retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether a broker connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Serialize `message` and publish it with `routing_key`.
    ///
    /// Connects first if needed. Fails with [`BusError::RetriesExhausted`]
    /// when the broker stays unreachable, and with
    /// [`BusError::PublisherNotReady`] when the connection was released
    /// before the message could be emitted.
    pub async fn publish<M: Message>(&self, message: &M, routing_key: &str) -> Result<()> {
        self.ensure_connected().await?;

        let outbound = OutboundMessage {
            message_type: M::TYPE_NAME.to_string(),
            payload: message::encode(message)?,
        };
        self.emit(routing_key, outbound).await?;

        debug!(
            message_type = M::TYPE_NAME,
            message_id = %message.id(),
            exchange = self.config.exchange(),
            routing_key,
            "Published message"
        );
        Ok(())
    }

    /// Emit on the current connection without connecting.
    async fn emit(&self, routing_key: &str, outbound: OutboundMessage) -> Result<()> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(BusError::PublisherNotReady)?;

        match connection
            .publish(self.config.exchange(), routing_key, outbound)
            .await
        {
            Err(e @ (BusError::Publish(_) | BusError::Closed)) => {
                warn!(
                    exchange = self.config.exchange(),
                    error = %e,
                    "Publish failed, discarding broker connection"
                );
                self.discard(&connection).await;
                Err(e)
            }
            result => result,
        }
    }

    /// Release `connection` if it is still the current one.
    async fn discard(&self, connection: &Arc<T::Connection>) {
        {
            let mut current = self.connection.write().await;
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
                *current = None;
            }
        }
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close discarded publisher connection");
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.connection.read().await.is_some() {
            return Ok(());
        }

        let _gate = self.connect_gate.lock().await;
        // Another publisher may have connected while we waited.
        if self.connection.read().await.is_some() {
            return Ok(());
        }

        let transport = &self.transport;
        let config = &self.config;
        let connection = self
            .retry
            .run("connect publisher", move || async move {
                let connection = transport.connect(config).await?;
                if let Err(e) = connection.declare_exchange(config.exchange()).await {
                    if let Err(close_err) = connection.close().await {
                        warn!(error = %close_err, "Failed to close publisher connection");
                    }
                    return Err(e);
                }
                Ok::<_, BusError>(connection)
            })
            .await?;

        info!(
            uri = %config.display_uri(),
            exchange = config.exchange(),
            "Publisher connected"
        );
        *self.connection.write().await = Some(Arc::new(connection));
        Ok(())
    }

    /// Release the broker connection. Closing an unconnected publisher is a
    /// no-op; the next publish reconnects.
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close().await?;
            info!(exchange = self.config.exchange(), "Publisher closed");
        }
        Ok(())
    }
}
