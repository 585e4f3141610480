use async_trait::async_trait;
use lettre::{
    Message,
    message::{Mailbox, header::ContentType},
    transport::smtp::{
        authentication::{Credentials, DEFAULT_MECHANISMS},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::relay::{MailRelayConfig, TlsMode};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("could not connect to SMTP relay {relay}: {reason}")]
    ConnectFailed { relay: String, reason: String },

    #[error("SMTP relay did not accept message to {recipient}: {reason}")]
    TransmitFailed { recipient: String, reason: String },

    #[error("invalid email message: {0}")]
    InvalidMessage(String),
}

/// Outbound email. Every call is independent: no connection outlives it.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send_plain(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError>;

    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), SendError>;
}

enum Body<'a> {
    Plain(&'a str),
    Html(&'a str),
}

impl Body<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Body::Plain(_) => "plain",
            Body::Html(_) => "html",
        }
    }
}

/// SMTP dispatcher over lettre. Each send runs on its own authenticated
/// session that is closed before the call returns.
pub struct SmtpMailer {
    relay: MailRelayConfig,
    sender: Mailbox,
    show_secrets: bool,
}

impl SmtpMailer {
    pub fn new(relay: MailRelayConfig) -> Result<Self, SendError> {
        let sender: Mailbox = relay.sender_address.parse().map_err(|e| {
            SendError::InvalidMessage(format!(
                "invalid sender address '{}': {}",
                relay.sender_address, e
            ))
        })?;

        info!(
            host = %relay.host,
            port = relay.port,
            sender = %relay.sender_address,
            tls = ?relay.tls,
            "SMTP mailer initialized"
        );

        Ok(Self {
            relay,
            sender,
            show_secrets: false,
        })
    }

    /// Logs the masked relay password on connect. Off unless explicitly enabled.
    pub fn with_secret_logging(mut self, enabled: bool) -> Self {
        self.show_secrets = enabled;
        self
    }

    pub fn relay(&self) -> &MailRelayConfig {
        &self.relay
    }

    fn relay_label(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    fn tls_parameters(&self) -> Result<TlsParameters, SendError> {
        TlsParameters::new(self.relay.host.clone()).map_err(|e| self.connect_failed(e))
    }

    fn connect_failed(&self, e: impl ToString) -> SendError {
        SendError::ConnectFailed {
            relay: self.relay_label(),
            reason: e.to_string(),
        }
    }

    fn log_connect_attempt(&self) {
        if self.show_secrets {
            info!(
                host = %self.relay.host,
                port = self.relay.port,
                username = %self.relay.username,
                password = %self.relay.masked_password(),
                "SMTP: dialing relay"
            );
        } else {
            info!(
                host = %self.relay.host,
                port = self.relay.port,
                username = %self.relay.username,
                "SMTP: dialing relay"
            );
        }
    }

    /// Opens one relay session: dial, optional TLS upgrade, then AUTH. Every
    /// failure up to and including authentication is a `ConnectFailed`.
    async fn open_session(&self) -> Result<AsyncSmtpConnection, SendError> {
        self.log_connect_attempt();

        let hello = ClientId::default();
        let wrapper = match self.relay.tls {
            TlsMode::Tls => Some(self.tls_parameters()?),
            TlsMode::Starttls | TlsMode::None => None,
        };

        let mut session = AsyncSmtpConnection::connect_tokio1(
            (self.relay.host.as_str(), self.relay.port),
            Some(self.relay.timeout),
            &hello,
            wrapper,
            None,
        )
        .await
        .map_err(|e| {
            error!(relay = %self.relay_label(), error = %e, "SMTP: dial error");
            self.connect_failed(e)
        })?;

        if self.relay.tls == TlsMode::Starttls {
            let upgrade = match self.tls_parameters() {
                Ok(params) => session
                    .starttls(params, &hello)
                    .await
                    .map_err(|e| self.connect_failed(e)),
                Err(e) => Err(e),
            };
            if let Err(e) = upgrade {
                error!(relay = %self.relay_label(), error = %e, "SMTP: STARTTLS failed");
                session.abort().await;
                return Err(e);
            }
        }

        let credentials = Credentials::new(
            self.relay.username.clone(),
            self.relay.password().to_string(),
        );
        if let Err(e) = session.auth(DEFAULT_MECHANISMS, &credentials).await {
            error!(
                relay = %self.relay_label(),
                username = %self.relay.username,
                error = %e,
                "SMTP: authentication rejected"
            );
            session.abort().await;
            return Err(self.connect_failed(e));
        }

        info!(
            host = %self.relay.host,
            port = self.relay.port,
            username = %self.relay.username,
            "SMTP: dial succeeded"
        );

        Ok(session)
    }

    async fn close_session(mut session: AsyncSmtpConnection) {
        if let Err(e) = session.quit().await {
            debug!(error = %e, "SMTP: QUIT not acknowledged");
            session.abort().await;
        }
    }

    /// Connects, authenticates and disconnects without sending anything.
    pub async fn verify(&self) -> Result<(), SendError> {
        let mut session = self.open_session().await?;

        if !session.test_connected().await {
            warn!(relay = %self.relay_label(), "SMTP: relay did not answer NOOP");
            session.abort().await;
            return Err(self.connect_failed("relay did not answer NOOP"));
        }

        Self::close_session(session).await;
        Ok(())
    }

    fn build_message(&self, to: &str, subject: &str, body: &Body<'_>) -> Result<Message, SendError> {
        let recipient: Mailbox = to.parse().map_err(|e| {
            SendError::InvalidMessage(format!("invalid recipient address '{}': {}", to, e))
        })?;

        let builder = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(subject);

        let message = match body {
            Body::Plain(text) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.to_string()),
            Body::Html(html) => builder
                .header(ContentType::TEXT_HTML)
                .body(html.to_string()),
        }
        .map_err(|e| SendError::InvalidMessage(e.to_string()))?;

        Ok(message)
    }

    async fn dispatch(&self, to: &str, subject: &str, body: Body<'_>) -> Result<(), SendError> {
        let message = self.build_message(to, subject, &body)?;

        let mut session = self.open_session().await?;

        info!(to, subject, kind = body.kind(), "SMTP: attempting to send message");

        match session.send(message.envelope(), &message.formatted()).await {
            Ok(response) => {
                debug!(to, code = %response.code(), "SMTP: relay response");
                info!(to, "SMTP: send OK");
                Self::close_session(session).await;
                Ok(())
            }
            Err(e) => {
                error!(to, error = %e, "SMTP: send error");
                session.abort().await;
                Err(SendError::TransmitFailed {
                    recipient: to.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send_plain(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError> {
        self.dispatch(to, subject, Body::Plain(body)).await
    }

    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), SendError> {
        self.dispatch(to, subject, Body::Html(html)).await
    }
}
