use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use notification_service::{
    clients::smtp::{MailSender, SendError},
    models::relay::{MailRelayConfig, TlsMode},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{Dispatch, Level};

pub const RELAY_USERNAME: &str = "notifier@example.com";
pub const RELAY_PASSWORD: &str = "app-password-1234";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

/// In-memory [`MailSender`] that records every call and fails for chosen recipients.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
    failing_recipients: Vec<String>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(recipient: &str) -> Self {
        Self {
            sent: Arc::default(),
            failing_recipients: vec![recipient.to_string()],
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, to: &str, subject: &str, body: &str, html: bool) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        });

        if self.failing_recipients.iter().any(|r| r == to) {
            return Err(SendError::TransmitFailed {
                recipient: to.to_string(),
                reason: "550 mailbox unavailable".to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send_plain(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError> {
        self.record(to, subject, body, false)
    }

    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), SendError> {
        self.record(to, subject, html, true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    pub reject_auth: bool,
    /// Accepts this many AUTH attempts across all sessions, then answers 535.
    pub accept_auth_attempts: Option<usize>,
    pub reject_recipient: Option<String>,
}

/// Scripted plaintext SMTP relay on 127.0.0.1, just enough protocol for lettre.
pub struct FakeRelay {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl FakeRelay {
    pub async fn start(behavior: RelayBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let commands = Arc::new(Mutex::new(Vec::new()));
        let messages = Arc::new(Mutex::new(Vec::new()));

        let (commands_task, messages_task) = (Arc::clone(&commands), Arc::clone(&messages));
        let auth_attempts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let commands = Arc::clone(&commands_task);
                let messages = Arc::clone(&messages_task);
                let auth_attempts = Arc::clone(&auth_attempts);
                tokio::spawn(async move {
                    let _ = serve_session(socket, behavior, commands, messages, auth_attempts).await;
                });
            }
        });

        Ok(Self {
            addr,
            commands,
            messages,
        })
    }

    pub fn relay_config(&self) -> MailRelayConfig {
        MailRelayConfig::new(
            self.addr.ip().to_string(),
            self.addr.port(),
            RELAY_USERNAME.to_string(),
            RELAY_PASSWORD.to_string(),
            None,
        )
        .expect("valid relay config")
        .with_tls(TlsMode::None)
        .with_timeout(Duration::from_secs(5))
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Number of commands starting with `verb`, case-insensitively.
    pub fn count(&self, verb: &str) -> usize {
        let verb = verb.to_ascii_uppercase();
        self.commands()
            .iter()
            .filter(|c| c.to_ascii_uppercase().starts_with(&verb))
            .count()
    }
}

async fn serve_session(
    socket: TcpStream,
    behavior: RelayBehavior,
    commands: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
    auth_attempts: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(b"220 fake.relay ESMTP ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let command = line.trim_end().to_string();
        let upper = command.to_ascii_uppercase();
        commands.lock().unwrap().push(command.clone());

        let reply: &[u8] = if upper.starts_with("EHLO") {
            b"250-fake.relay\r\n250 AUTH PLAIN LOGIN\r\n"
        } else if upper.starts_with("HELO") {
            b"250 fake.relay\r\n"
        } else if upper.starts_with("AUTH") {
            let attempt = auth_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let over_limit = behavior
                .accept_auth_attempts
                .is_some_and(|limit| attempt > limit);
            if behavior.reject_auth || over_limit {
                b"535 5.7.8 Authentication credentials invalid\r\n"
            } else {
                b"235 2.7.0 Authentication successful\r\n"
            }
        } else if upper.starts_with("MAIL FROM") {
            b"250 2.1.0 OK\r\n"
        } else if upper.starts_with("RCPT TO") {
            let rejected = behavior
                .reject_recipient
                .as_deref()
                .is_some_and(|r| command.contains(r));
            if rejected {
                b"550 5.1.1 No such user here\r\n"
            } else {
                b"250 2.1.5 OK\r\n"
            }
        } else if upper == "DATA" {
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;

            let mut data = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line.trim_end_matches(['\r', '\n']) == "." {
                    break;
                }
                data.push_str(&line);
            }
            messages.lock().unwrap().push(data);

            b"250 2.0.0 Queued\r\n"
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 2.0.0 Bye\r\n").await?;
            return Ok(());
        } else {
            b"250 2.0.0 OK\r\n"
        };

        writer.write_all(reply).await?;
    }
}

/// Formatted `tracing` output captured in memory.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// A dispatcher that writes every event at DEBUG and above into a fresh buffer.
    pub fn start() -> (Self, Dispatch) {
        let logs = Self::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(Level::DEBUG)
            .with_writer(move || sink.clone())
            .finish();

        (logs, Dispatch::new(subscriber))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
