//! Outbound mail: one authenticated SMTP session per message.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{error, info};

use crate::config::SmtpConfig;
use crate::error::SendError;

/// Sends a single plain-text message. Never retries; the caller decides.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError>;
}

/// SMTP submission with STARTTLS and credential login.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError> {
        let config = self.config.clone();
        let recipient = to.to_string();
        let subject = subject.to_string();
        let body = body.to_string();

        let result = tokio::task::spawn_blocking(move || {
            send_blocking(&config, &recipient, &subject, body)
        })
        .await
        .map_err(|e| SendError::Task(e.to_string()))
        .and_then(|r| r);

        match &result {
            Ok(()) => info!(recipient = %to, "Auto-response sent"),
            Err(e) => error!(recipient = %to, error = %e, "Failed to send auto-response"),
        }
        result
    }
}

fn build_message(
    sender: &str,
    to: &str,
    subject: &str,
    body: String,
) -> Result<Message, SendError> {
    let from = sender.parse().map_err(|e: lettre::address::AddressError| {
        SendError::InvalidAddress {
            address: sender.to_string(),
            reason: e.to_string(),
        }
    })?;
    let to = to.parse().map_err(|e: lettre::address::AddressError| {
        SendError::InvalidAddress {
            address: to.to_string(),
            reason: e.to_string(),
        }
    })?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body)
        .map_err(|e| SendError::Build(e.to_string()))
}

fn send_blocking(
    config: &SmtpConfig,
    to: &str,
    subject: &str,
    body: String,
) -> Result<(), SendError> {
    let email = build_message(&config.sender, to, subject, body)?;

    let creds = Credentials::new(
        config.sender.clone(),
        config.password.expose_secret().to_string(),
    );
    let transport = SmtpTransport::starttls_relay(&config.host)
        .map_err(|e| SendError::Transport(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    transport
        .send(&email)
        .map_err(|e| SendError::Transport(format!("SMTP send failed: {e}")))?;
    Ok(())
}
