use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed notification payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("notification payload has no recipient email")]
    MissingRecipient,
}

/// A single email notification, as published on the wire:
/// `{"email": "<recipient>", "message": "<body>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    #[serde(rename = "email")]
    recipient: String,
    #[serde(rename = "message")]
    body: String,
}

#[derive(Deserialize)]
struct RawEvent {
    email: Option<String>,
    message: String,
}

impl NotificationEvent {
    pub fn new(
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, DecodeError> {
        let recipient = recipient.into();
        if recipient.trim().is_empty() {
            return Err(DecodeError::MissingRecipient);
        }

        Ok(Self {
            recipient,
            body: body.into(),
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_parts(self) -> (String, String) {
        (self.recipient, self.body)
    }
}

/// Decodes a raw message payload. Field values are kept verbatim.
pub fn decode(payload: &[u8]) -> Result<NotificationEvent, DecodeError> {
    let raw: RawEvent = serde_json::from_slice(payload)?;

    NotificationEvent::new(raw.email.unwrap_or_default(), raw.message)
}
