use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::{
    clients::smtp::{MailSender, SendError},
    models::event::{DecodeError, decode},
};

pub const NOTIFICATION_SUBJECT: &str = "Auction Notification";

/// Per-message callback driven by the queue consumer.
///
/// Implementations resolve every failure locally; nothing is returned to the
/// consume loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event_name: &str, payload: &[u8]);
}

#[derive(Debug)]
pub enum HandleOutcome {
    Sent { recipient: String },
    Rejected(DecodeError),
    Failed { recipient: String, error: SendError },
}

impl HandleOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, HandleOutcome::Sent { .. })
    }
}

/// Decodes notification events and emails them through a [`MailSender`].
pub struct NotificationHandler<M> {
    mailer: M,
}

impl<M: MailSender> NotificationHandler<M> {
    pub fn new(mailer: M) -> Self {
        Self { mailer }
    }

    pub async fn handle_event(&self, event_name: &str, payload: &[u8]) -> HandleOutcome {
        debug!(
            event = event_name,
            payload = %String::from_utf8_lossy(payload),
            "Handling event"
        );

        let event = match decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(event = event_name, error = %e, "Invalid notification payload, dropping");
                return HandleOutcome::Rejected(e);
            }
        };

        let (recipient, body) = event.into_parts();

        info!(
            event = event_name,
            to = %recipient,
            subject = NOTIFICATION_SUBJECT,
            "Attempting to send email"
        );

        match self
            .mailer
            .send_plain(&recipient, NOTIFICATION_SUBJECT, &body)
            .await
        {
            Ok(()) => {
                info!(event = event_name, to = %recipient, "Email sent successfully");
                HandleOutcome::Sent { recipient }
            }
            Err(e) => {
                error!(event = event_name, to = %recipient, error = %e, "Failed to send email");
                HandleOutcome::Failed {
                    recipient,
                    error: e,
                }
            }
        }
    }
}

#[async_trait]
impl<M: MailSender> MessageHandler for NotificationHandler<M> {
    async fn handle(&self, event_name: &str, payload: &[u8]) {
        self.handle_event(event_name, payload).await;
    }
}
