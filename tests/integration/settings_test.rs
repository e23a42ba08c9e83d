//! Settings file to running subscriber.

use std::io::Write;

use bitlet::bus::ChannelBroker;
use bitlet::config::{ConfigError, ConnectionConfig, Settings, SubscriberConfig};
use bitlet::Subscriber;

use crate::common::*;

const SETTINGS: &str = r#"
RabbitMQ:
  Host: rabbitmq.internal
  Port: 5673
  VirtualHost: models
  Username: reader
  Password: hunter2
  Exchange: example-models
  Queue: settings-reader
  RoutingKey: models.created
"#;

fn settings_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_settings_file_builds_configs() {
    let file = settings_file(SETTINGS);
    let settings = Settings::load(file.path().to_str()).unwrap();
    let section = settings.rabbitmq().unwrap();

    let connection = ConnectionConfig::from_section(&section).unwrap();
    assert_eq!(connection.host(), "rabbitmq.internal");
    assert_eq!(connection.port(), 5673);
    assert_eq!(connection.display_uri(), "amqp://reader@rabbitmq.internal:5673/models");
    assert!(!format!("{:?}", connection).contains("hunter2"));

    let subscriber = SubscriberConfig::from_section(&section).unwrap();
    assert_eq!(subscriber.queue(), "settings-reader");
    assert_eq!(subscriber.routing_key(), "models.created");
}

#[test]
fn test_settings_without_broker_section() {
    let file = settings_file("Logging:\n  Level: debug\n");
    let settings = Settings::load(file.path().to_str()).unwrap();

    assert!(matches!(settings.rabbitmq(), Err(ConfigError::MissingSection(_))));
}

#[test]
fn test_settings_with_bad_port() {
    let file = settings_file(&SETTINGS.replace("5673", "amqp"));
    let settings = Settings::load(file.path().to_str()).unwrap();
    let section = settings.rabbitmq().unwrap();

    assert!(matches!(
        ConnectionConfig::from_section(&section),
        Err(ConfigError::InvalidPort(_))
    ));
}

#[tokio::test]
async fn test_subscriber_from_settings_declares_topology() {
    let file = settings_file(SETTINGS);
    let section = Settings::load(file.path().to_str()).unwrap().rabbitmq().unwrap();
    let config = SubscriberConfig::from_section(&section).unwrap();

    let broker = ChannelBroker::new();
    let running = Subscriber::new(
        bitlet::bus::ChannelTransport::new(broker.clone()),
        config,
        registry(),
        projection(),
        ModelStore::default(),
    )
    .with_retry_policy(fast_retry())
    .start()
    .await
    .unwrap();

    assert!(broker.has_exchange("example-models"));
    assert!(broker.is_bound("settings-reader", "example-models", "models.created"));

    running.stop().await.unwrap();
}
