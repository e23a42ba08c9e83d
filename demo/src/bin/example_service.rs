//! example-service: read-model subscriber
//!
//! Consumes the configured queue and projects `ExampleModelCreated` events
//! into an in-memory store. Exits with an error if the subscriber stops on
//! its own.
//!
//! ## Configuration
//! - `config.yaml` in the working directory, `--config <path>`, or
//!   `BITLET_CONFIG`
//! - Overrides via environment, e.g. `BITLET__RABBITMQ__HOST=rabbitmq`
//! - `BITLET_LOG` sets the log filter (default `info`)

use std::sync::Arc;

use tracing::{error, info};

use bitlet::config::{Settings, SubscriberConfig};
use bitlet::{MessageTypeRegistry, Subscriber, SubscriberState};
use bitlet_demo::{dispatcher, ModelStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bitlet::utils::bootstrap::init_tracing();

    let config_path = bitlet::utils::bootstrap::parse_config_path();
    let settings = Settings::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let config = SubscriberConfig::from_section(&settings.rabbitmq()?)?;

    info!("Starting example-service");

    let registry = Arc::new(MessageTypeRegistry::from_inventory()?);
    info!(types = ?registry.type_names(), "Message types registered");

    let store = ModelStore::new();
    let running = Subscriber::amqp(config, registry, dispatcher()?, store.clone())
        .start()
        .await?;

    info!("example-service running, press Ctrl+C to exit");

    let mut states = running.state_changes();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            running.stop().await?;
        }
        _ = states.wait_for(|state| *state == SubscriberState::Stopped) => {
            // The broker stayed unreachable after losing the connection.
            running.stopped().await?;
            return Err("subscriber stopped unexpectedly".into());
        }
    }

    info!(models = store.len()?, "example-service stopped");
    Ok(())
}
