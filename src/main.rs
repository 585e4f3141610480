use std::sync::Arc;

use anyhow::{Error, Result};
use notification_service::{
    clients::{rbmq::RabbitMqClient, smtp::SmtpMailer},
    config::Config,
    handler::NotificationHandler,
    utils::init_tracing,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);
    config.report_fallbacks();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let relay = config.relay_config().inspect_err(|e| {
        error!(error = %e, "SMTP credentials are not configured");
    })?;

    info!(sender = %relay.sender_address, "Notifier sender resolved");

    let mailer = SmtpMailer::new(relay)?.with_secret_logging(config.debug_show_secrets);
    let handler = Arc::new(NotificationHandler::new(mailer));

    let consumer = RabbitMqClient::connect(&config.rabbitmq_url, config.topology(), handler)
        .await
        .inspect_err(|e| error!(error = %e, "RabbitMQ topology setup failed"))?;

    let state = consumer.subscribe_state();
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = consumer.start(cancel).await;
    info!(state = ?*state.borrow(), "Notifier stopped");

    result?;

    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    cancel.cancel();
}
