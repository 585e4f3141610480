//! Publishes a single test notification to the `events` exchange.

use anyhow::{Error, Result};
use clap::Parser;
use notification_service::{
    clients::rbmq::EventPublisher, config::Config, models::event::NotificationEvent,
    utils::init_tracing,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "publish", about = "Publish a test notification event")]
struct Args {
    /// Recipient address
    #[arg(long, env = "RECIPIENT_EMAIL")]
    recipient: String,

    /// Message body
    #[arg(long, default_value = "This is a test notification from the service.")]
    message: String,

    /// Routing key; defaults to the configured queue name
    #[arg(long)]
    routing_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    let args = Args::parse();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let event = NotificationEvent::new(args.recipient, args.message)?;
    let routing_key = args.routing_key.unwrap_or_else(|| config.queue_name.clone());

    let publisher = EventPublisher::connect(&config.rabbitmq_url).await?;
    publisher.publish(&routing_key, &event).await?;
    publisher.close().await?;

    info!(to = %event.recipient(), routing_key = %routing_key, "Test notification published");

    Ok(())
}
