//! Outbound notifications — the email / SMS capability the router consumes.
//!
//! Sends are opaque pass/fail calls. Nothing here retries; callers decide
//! whether a failure matters.

pub mod email;
pub mod sms;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use email::{SmtpConfig, SmtpSender};
pub use sms::{HttpSmsSender, SmsConfig};

/// Something that can deliver a message to a lead or agent.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError>;
}

/// Routes each channel to its configured sender.
///
/// A channel without configuration fails with `NotConfigured`.
#[derive(Default)]
pub struct Outbound {
    email: Option<SmtpSender>,
    sms: Option<HttpSmsSender>,
}

impl Outbound {
    pub fn new(email: Option<SmtpSender>, sms: Option<HttpSmsSender>) -> Self {
        Self { email, sms }
    }

    /// Build senders for every channel that has environment configuration.
    pub fn from_env() -> Self {
        Self {
            email: SmtpConfig::from_env().map(SmtpSender::new),
            sms: SmsConfig::from_env().map(HttpSmsSender::new),
        }
    }

    pub fn active_channels(&self) -> Vec<&'static str> {
        let mut channels = Vec::new();
        if self.email.is_some() {
            channels.push("email");
        }
        if self.sms.is_some() {
            channels.push("sms");
        }
        channels
    }
}

#[async_trait]
impl MessageSender for Outbound {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        match &self.email {
            Some(sender) => sender.send_email(to, subject, body).await,
            None => Err(ChannelError::NotConfigured {
                name: "email".into(),
            }),
        }
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        match &self.sms {
            Some(sender) => sender.send_text(to, body).await,
            None => Err(ChannelError::NotConfigured { name: "sms".into() }),
        }
    }
}
