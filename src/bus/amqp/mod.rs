//! AMQP (RabbitMQ) transport.
//!
//! One connection with one channel per publisher or subscriber. Messages go
//! to a durable fanout exchange with the type name in the `MessageType`
//! header; consumers use manual acknowledgement.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    Acker, BusError, Connection, Delivery, DeliveryStream, OutboundMessage, Result, Transport,
    MESSAGE_TYPE_HEADER,
};
use crate::config::ConnectionConfig;

/// Reply code sent when closing channel and connection.
const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "Goodbye";

/// Delivery mode marking messages persistent.
const PERSISTENT: u8 = 2;

/// Transport opening RabbitMQ connections through lapin.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the connection URI from configuration parts, so credentials and
/// virtual host never need escaping.
fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username().to_string(),
                password: config.password().to_string(),
            },
            host: config.host().to_string(),
            port: config.port(),
        },
        vhost: config.virtual_host().to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Connection = AmqpConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<AmqpConnection> {
        let connection = lapin::Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect to {}: {}", config.display_uri(), e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(uri = %config.display_uri(), "Connected to AMQP");

        Ok(AmqpConnection {
            connection,
            channel,
            closed: AtomicBool::new(false),
        })
    }
}

/// A lapin connection and its channel.
pub struct AmqpConnection {
    connection: lapin::Connection,
    channel: Channel,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;
        debug!(exchange, "Declared fanout exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        debug!(queue, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(queue, exchange, routing_key, "Bound queue to exchange");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(type_headers(&message.message_type));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    ..Default::default()
                },
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    Delivery::new(
                        message_type(delivery.properties.headers()),
                        delivery.data,
                        delivery.redelivered,
                        AmqpAcker {
                            acker: delivery.acker,
                        },
                    )
                })
                .map_err(|e| BusError::Subscribe(format!("Consumer delivery error: {}", e)))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.channel.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await {
            warn!(error = %e, "Failed to close channel");
        }
        self.connection
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;

        info!("Closed AMQP connection");
        Ok(())
    }
}

fn type_headers(message_type: &str) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        MESSAGE_TYPE_HEADER.into(),
        AMQPValue::LongString(message_type.into()),
    );
    headers
}

/// Read the `MessageType` header. Other clients may send it as a short
/// string or raw bytes; anything that is not UTF-8 text counts as missing.
fn message_type(headers: &Option<FieldTable>) -> Option<String> {
    let value = headers.as_ref()?.inner().get(MESSAGE_TYPE_HEADER)?;
    let bytes = match value {
        AMQPValue::LongString(s) => s.as_bytes(),
        AMQPValue::ShortString(s) => s.as_str().as_bytes(),
        AMQPValue::ByteArray(b) => b.as_slice(),
        _ => return None,
    };
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

struct AmqpAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(format!("Failed to nack: {}", e)))
    }
}
