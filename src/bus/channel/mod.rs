//! In-memory channel broker.
//!
//! Models the subset of RabbitMQ semantics the bus relies on: durable fanout
//! exchanges, named queues with bindings, per-consumer delivery over tokio
//! channels, manual acknowledgement, and requeue-on-reject redelivery.
//! Unsettled deliveries return to their queue when the consumer or connection
//! goes away.
//!
//! Used for tests and local development without an external broker. Supports
//! fault injection for connection establishment, consumer registration and
//! broker-side connection loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Acker, Acknowledgement, BusError, Connection, Delivery, DeliveryStream, OutboundMessage,
    Result, Transport,
};
use crate::config::ConnectionConfig;

/// A message sitting in a queue.
#[derive(Debug, Clone)]
struct StoredMessage {
    message_type: Option<String>,
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    connection_id: u64,
    message: StoredMessage,
}

/// Record of one delivery settlement, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub message_type: Option<String>,
    pub acknowledgement: Acknowledgement,
    pub redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    settlements: Vec<Settlement>,
    next_delivery_tag: u64,
    next_connection_id: u64,
    open_connections: usize,
    /// Close flags of open connections, by connection id.
    live: HashMap<u64, Arc<AtomicBool>>,
    connect_attempts: u32,
    fail_connects: u32,
    fail_consumes: u32,
}

impl BrokerState {
    /// Hand ready messages of `queue` to its consumers, round robin.
    fn pump(&mut self, broker: &ChannelBroker, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let slot_index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let Some(slot) = queue.consumers.get(slot_index) else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = Delivery::new(
                message.message_type.clone(),
                message.payload.clone(),
                message.redelivered,
                ChannelAcker {
                    broker: broker.clone(),
                    delivery_tag,
                },
            );
            let connection_id = slot.connection_id;

            if slot.sender.send(delivery).is_err() {
                // Receiver is gone; drop the consumer and retry the message.
                queue.consumers.remove(slot_index);
                queue.ready.push_front(message);
                continue;
            }

            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    connection_id,
                    message,
                },
            );
        }
    }

    /// Return unsettled deliveries matching `owned` to the front of their queue.
    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) -> Vec<String> {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| owned(u))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so that push_front restores delivery order.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(unacked.message);
                }
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue);
                }
            }
        }
        touched
    }

    /// Drop consumers and unsettled deliveries owned by connection `id`.
    fn disconnect(&mut self, broker: &ChannelBroker, id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection_id != id);
        }
        for queue in self.requeue_unacked(|u| u.connection_id == id) {
            self.pump(broker, &queue);
        }
        self.live.remove(&id);
        self.open_connections = self.open_connections.saturating_sub(1);
    }
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().fail_connects = count;
    }

    /// Make the next `count` consume calls fail.
    pub fn fail_next_consumes(&self, count: u32) {
        self.state().fail_consumes = count;
    }

    /// Close every open connection from the broker side, as a broker restart
    /// would. Delivery streams of their consumers end and unsettled
    /// deliveries return to their queues.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let live: Vec<(u64, Arc<AtomicBool>)> = state.live.drain().collect();
        for (id, closed) in live {
            if !closed.swap(true, Ordering::SeqCst) {
                state.disconnect(self, id);
            }
        }
        info!("Dropped all channel broker connections");
    }

    /// Connection attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state().exchanges.contains(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Whether `queue` is bound to `exchange` with `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|(e, q, k)| e == exchange && q == queue && k == routing_key)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in `queue` (not yet delivered).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    /// Poll until at least `count` settlements are recorded.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Result<Vec<Settlement>> {
        let poll = async {
            loop {
                let settlements = self.settlements();
                if settlements.len() >= count {
                    return settlements;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            BusError::Subscribe(format!(
                "Timed out waiting for {} settlements (have {})",
                count,
                self.settlements().len()
            ))
        })
    }

    /// Route a raw message through `exchange`, bypassing any publisher.
    ///
    /// Lets callers produce deliveries a well-behaved publisher never would,
    /// such as ones without a type header.
    pub fn inject(
        &self,
        exchange: &str,
        message_type: Option<&str>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<usize> {
        self.route(
            exchange,
            StoredMessage {
                message_type: message_type.map(str::to_string),
                payload: payload.into(),
                redelivered: false,
            },
        )
    }

    /// Fanout: every queue bound to the exchange gets a copy, whatever the
    /// routing key.
    fn route(&self, exchange: &str, message: StoredMessage) -> Result<usize> {
        let mut state = self.state();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Publish(format!("Exchange '{}' not found", exchange)));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(e, _, _)| e == exchange)
            .map(|(_, q, _)| q.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
            state.pump(self, queue);
        }
        Ok(targets.len())
    }

    fn settle(&self, delivery_tag: u64, acknowledgement: Acknowledgement) -> Result<()> {
        let mut state = self.state();
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            BusError::Acknowledge(format!("Unknown delivery tag {}", delivery_tag))
        })?;

        state.settlements.push(Settlement {
            queue: unacked.queue.clone(),
            message_type: unacked.message.message_type.clone(),
            acknowledgement,
            redelivered: unacked.message.redelivered,
        });

        if let Acknowledgement::Reject { requeue: true } = acknowledgement {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(message);
            }
            state.pump(self, &unacked.queue);
        }
        Ok(())
    }
}

struct ChannelAcker {
    broker: ChannelBroker,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(self.delivery_tag, Acknowledgement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker
            .settle(self.delivery_tag, Acknowledgement::Reject { requeue })
    }
}

/// Transport that connects to a [`ChannelBroker`].
#[derive(Clone, Default)]
pub struct ChannelTransport {
    broker: ChannelBroker,
}

impl ChannelTransport {
    pub fn new(broker: ChannelBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    type Connection = ChannelConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<ChannelConnection> {
        let mut state = self.broker.state();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BusError::Connection(format!(
                "Connection refused by {}",
                config.display_uri()
            )));
        }

        state.next_connection_id += 1;
        state.open_connections += 1;
        let id = state.next_connection_id;
        let closed = Arc::new(AtomicBool::new(false));
        state.live.insert(id, Arc::clone(&closed));
        drop(state);

        info!(uri = %config.display_uri(), connection_id = id, "Connected to channel broker");

        Ok(ChannelConnection {
            broker: self.broker.clone(),
            id,
            closed,
        })
    }
}

/// Connection to a [`ChannelBroker`].
pub struct ChannelConnection {
    broker: ChannelBroker,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl ChannelConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.state().exchanges.insert(exchange.to_string());
        debug!(exchange, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .state()
            .queues
            .entry(queue.to_string())
            .or_default();
        debug!(queue, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Subscribe(format!("Exchange '{}' not found", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Subscribe(format!("Queue '{}' not found", queue)));
        }
        let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        let queues = self.broker.route(
            exchange,
            StoredMessage {
                message_type: Some(message.message_type),
                payload: message.payload,
                redelivered: false,
            },
        )?;
        debug!(exchange, routing_key, queues, "Published to channel broker");
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            if state.fail_consumes > 0 {
                state.fail_consumes -= 1;
                return Err(BusError::Subscribe(format!("Consumer on '{}' refused", queue)));
            }
            let slot = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("Queue '{}' not found", queue)))?;
            slot.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                connection_id: self.id,
                sender,
            });
            state.pump(&self.broker, queue);
        }

        let stream = futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).map(Ok::<Delivery, BusError>);
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.state();
        let id = self.id;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.connection_id == id && c.tag == consumer_tag));
        }
        debug!(consumer_tag, "Cancelled consumer");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let broker = self.broker.clone();
        broker.state().disconnect(&broker, self.id);
        info!(connection_id = self.id, "Closed channel broker connection");
        Ok(())
    }
}
