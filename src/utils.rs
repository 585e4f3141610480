use std::any::Any;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Masks a credential for logging: inputs of 4 characters or fewer become all
/// asterisks, longer inputs keep only their last 4 characters.
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();

    if len <= 4 {
        return "*".repeat(len);
    }

    let tail: String = secret.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), tail)
}

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
