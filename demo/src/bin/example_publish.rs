//! example-publish: emit one `ExampleModelCreated` event
//!
//! Usage: example-publish [--config <path>]
//!
//! Uses the same configuration sources as example-service.

use tracing::{error, info};
use uuid::Uuid;

use bitlet::config::{ConnectionConfig, Settings};
use bitlet::Publisher;
use bitlet_demo::ExampleModelCreated;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bitlet::utils::bootstrap::init_tracing();

    let config_path = bitlet::utils::bootstrap::parse_config_path();
    let settings = Settings::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let config = ConnectionConfig::from_section(&settings.rabbitmq()?)?;

    let publisher = Publisher::amqp(config);
    let event = ExampleModelCreated::new(Uuid::new_v4());
    publisher.publish(&event, "").await?;
    info!(message_id = %event.id, model_id = %event.model_id, "Published ExampleModelCreated");

    publisher.close().await?;
    Ok(())
}
