//! End-to-end delivery handling: publish, consume, dispatch, settle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitlet::bus::{dispatch::HandlerResult, Acknowledgement, BusError, ChannelBroker};
use bitlet::{Dispatcher, SubscriberState};
use uuid::Uuid;

use crate::common::*;

#[derive(Debug)]
struct ReadModelUnavailable;

impl std::fmt::Display for ReadModelUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("read model unavailable")
    }
}

impl std::error::Error for ReadModelUnavailable {}

#[tokio::test]
async fn test_created_event_is_projected_and_acked() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();

    let model_id = Uuid::new_v4();
    publisher(&broker)
        .publish(&ExampleModelCreated::new(model_id), "")
        .await
        .unwrap();

    let settlements = broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert_eq!(settlements[0].queue, QUEUE);
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Ack);
    assert_eq!(store.get(model_id), Some(ExampleModel { id: model_id }));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_type_is_acked_without_handler() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();

    broker
        .inject(EXCHANGE, Some("UnknownKind"), r#"{"id":"00000000-0000-0000-0000-000000000000"}"#)
        .unwrap();

    let settlements = broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Ack);
    assert_eq!(settlements[0].message_type.as_deref(), Some("UnknownKind"));
    assert_eq!(store.len(), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_type_header_is_rejected() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();

    let payload = serde_json::to_vec(&ExampleModelCreated::new(Uuid::new_v4())).unwrap();
    broker.inject(EXCHANGE, None, payload).unwrap();

    let settlements = broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Reject { requeue: false });
    assert_eq!(store.len(), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_failure_is_requeued_and_reprocessed() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let failures_left = Arc::new(AtomicUsize::new(1));

    let dispatcher = {
        let failures_left = failures_left.clone();
        Dispatcher::new()
            .on(move |event: ExampleModelCreated, store: ModelStore| {
                let failures_left = failures_left.clone();
                async move {
                    let result: HandlerResult = if failures_left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        Err(Box::new(ReadModelUnavailable))
                    } else {
                        store.insert(ExampleModel { id: event.model_id });
                        Ok(true)
                    };
                    result
                }
            })
            .unwrap()
    };
    let running = subscriber(&broker, dispatcher, store.clone()).start().await.unwrap();

    let model_id = Uuid::new_v4();
    publisher(&broker)
        .publish(&ExampleModelCreated::new(model_id), "")
        .await
        .unwrap();

    let settlements = broker.wait_for_settlements(2, WAIT).await.unwrap();
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Reject { requeue: true });
    assert!(!settlements[0].redelivered);
    assert_eq!(settlements[1].acknowledgement, Acknowledgement::Ack);
    assert!(settlements[1].redelivered);
    assert!(store.get(model_id).is_some());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_declined_message_is_not_redelivered() {
    let broker = ChannelBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::new()
        .on_sync(|_: ExampleModelCreated, calls: Arc<AtomicUsize>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .unwrap();
    let running = subscriber(&broker, dispatcher, calls.clone()).start().await.unwrap();

    publisher(&broker)
        .publish(&ExampleModelCreated::new(Uuid::new_v4()), "")
        .await
        .unwrap();

    let settlements = broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Reject { requeue: false });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.settlements().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ready_count(QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_registered_type_without_handler_is_rejected() {
    let broker = ChannelBroker::new();
    let running = subscriber(&broker, projection(), ModelStore::default())
        .start()
        .await
        .unwrap();

    publisher(&broker)
        .publish(&ExampleModelArchived::new(Uuid::new_v4()), "")
        .await
        .unwrap();

    let settlements = broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert_eq!(settlements[0].acknowledgement, Acknowledgement::Reject { requeue: false });

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_deliveries_are_processed_in_order() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();

    let publisher = publisher(&broker);
    let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        publisher.publish(&ExampleModelCreated::new(*id), "").await.unwrap();
    }

    let settlements = broker.wait_for_settlements(ids.len(), WAIT).await.unwrap();
    assert!(settlements.iter().all(|s| s.acknowledgement == Acknowledgement::Ack));
    assert_eq!(store.len(), ids.len());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_each_queue_gets_its_own_copy() {
    let broker = ChannelBroker::new();
    let first = ModelStore::default();
    let second = ModelStore::default();

    let first_running = subscriber(&broker, projection(), first.clone())
        .start()
        .await
        .unwrap();
    let second_config = bitlet::config::SubscriberConfig::new(connection_config(), "audit-log").unwrap();
    let second_running = bitlet::Subscriber::new(
        bitlet::bus::ChannelTransport::new(broker.clone()),
        second_config,
        registry(),
        projection(),
        second.clone(),
    )
    .start()
    .await
    .unwrap();

    let model_id = Uuid::new_v4();
    publisher(&broker)
        .publish(&ExampleModelCreated::new(model_id), "")
        .await
        .unwrap();

    broker.wait_for_settlements(2, WAIT).await.unwrap();
    assert!(first.get(model_id).is_some());
    assert!(second.get(model_id).is_some());

    first_running.stop().await.unwrap();
    second_running.stop().await.unwrap();
}

#[tokio::test]
async fn test_messages_published_while_stopped_wait_in_queue() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();

    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();
    let states = running.state_changes();
    running.stop().await.unwrap();
    assert_eq!(*states.borrow(), SubscriberState::Stopped);

    let model_id = Uuid::new_v4();
    publisher(&broker)
        .publish(&ExampleModelCreated::new(model_id), "")
        .await
        .unwrap();
    assert_eq!(broker.ready_count(QUEUE), 1);

    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();
    broker.wait_for_settlements(1, WAIT).await.unwrap();
    assert!(store.get(model_id).is_some());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_publisher_and_subscriber_recover_from_broker_restart() {
    let broker = ChannelBroker::new();
    let store = ModelStore::default();
    let running = subscriber(&broker, projection(), store.clone())
        .start()
        .await
        .unwrap();
    let publisher = publisher(&broker);
    publisher
        .publish(&ExampleModelCreated::new(Uuid::new_v4()), "")
        .await
        .unwrap();
    broker.wait_for_settlements(1, WAIT).await.unwrap();

    broker.drop_connections();

    let lost = publisher
        .publish(&ExampleModelCreated::new(Uuid::new_v4()), "")
        .await;
    assert!(matches!(lost, Err(BusError::Closed)));

    tokio::time::timeout(WAIT, async {
        while broker.consumer_count(QUEUE) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let model_id = Uuid::new_v4();
    publisher
        .publish(&ExampleModelCreated::new(model_id), "")
        .await
        .unwrap();
    broker.wait_for_settlements(2, WAIT).await.unwrap();

    assert_eq!(store.get(model_id), Some(ExampleModel { id: model_id }));
    assert_eq!(store.len(), 2);
    assert_eq!(running.state(), SubscriberState::Consuming);
    running.stop().await.unwrap();
}
