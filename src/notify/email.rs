//! SMTP email sender via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::ChannelError;
use crate::notify::MessageSender;

/// Per-command socket timeout for the SMTP session.
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (email disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

/// Build the message, rejecting bad addresses before any network I/O.
fn build_message(
    config: &SmtpConfig,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<Message, ChannelError> {
    let from: Mailbox = config.from_address.parse().map_err(|e| ChannelError::SendFailed {
        name: "email".into(),
        reason: format!("Invalid from address: {e}"),
    })?;
    let to: Mailbox = to.parse().map_err(|_| ChannelError::InvalidRecipient {
        name: "email".into(),
        recipient: to.to_string(),
    })?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Failed to build email: {e}"),
        })
}

/// Blocking SMTP send. Run on the blocking pool.
fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .credentials(creds)
        .timeout(Some(SMTP_TIMEOUT))
        .build();

    transport.send(message).map_err(|e| ChannelError::SendFailed {
        name: "email".into(),
        reason: format!("SMTP send failed: {e}"),
    })?;
    Ok(())
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let message = build_message(&self.config, to, subject, body)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || send_blocking(&config, &message))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP task failed: {e}"),
            })??;

        tracing::info!(to = %to, "Email sent");
        Ok(())
    }

    async fn send_text(&self, _to: &str, _body: &str) -> Result<(), ChannelError> {
        Err(ChannelError::NotConfigured { name: "sms".into() })
    }
}
