//! Checks that the configured SMTP relay accepts the configured credentials.

use std::process::ExitCode;

use anyhow::{Error, Result};
use clap::Parser;
use notification_service::{
    clients::smtp::SmtpMailer,
    config::Config,
    models::relay::{MailRelayConfig, TlsMode},
    utils::init_tracing,
};
use tracing::{error, info};

const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Parser, Debug)]
#[command(name = "smtpcheck", about = "Verify SMTP relay connectivity and authentication")]
struct Args {
    /// Also try implicit TLS on port 465 if the configured port fails
    #[arg(long)]
    try465: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    let args = Args::parse();
    let config = Config::load()?;
    init_tracing(config.log_format);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let relay = config.relay_config()?;
    let secrets = config.debug_show_secrets;

    info!(
        username = %relay.username,
        host = %relay.host,
        port = relay.port,
        "Checking SMTP auth"
    );

    if try_dial(relay.clone(), secrets).await {
        return Ok(ExitCode::SUCCESS);
    }

    if args.try465 {
        info!("Trying fallback to port 465 (implicit TLS)");
        let fallback = relay.with_port(IMPLICIT_TLS_PORT).with_tls(TlsMode::Tls);
        if try_dial(fallback, secrets).await {
            return Ok(ExitCode::SUCCESS);
        }
    }

    Ok(ExitCode::from(2))
}

async fn try_dial(relay: MailRelayConfig, show_secrets: bool) -> bool {
    let mailer = match SmtpMailer::new(relay) {
        Ok(mailer) => mailer.with_secret_logging(show_secrets),
        Err(e) => {
            error!(error = %e, "Invalid relay configuration");
            return false;
        }
    };

    match mailer.verify().await {
        Ok(()) => {
            info!(
                host = %mailer.relay().host,
                port = mailer.relay().port,
                "Authentication OK (dial succeeded)"
            );
            true
        }
        Err(e) => {
            error!(error = %e, "Dial failed");
            false
        }
    }
}
