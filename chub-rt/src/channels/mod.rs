//! External side-channel senders (email, SMS)
//!
//! In-app delivery goes through [`crate::delivery`]. The senders here wrap
//! third-party HTTP APIs behind one trait so the notification service can
//! treat every channel alike.

use async_trait::async_trait;
use chub_common::config::{EmailConfig, SmsConfig};
use chub_common::db::models::{DeliveryChannel, User};
use chub_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

mod email;
mod sms;

pub use email::EmailSender;
pub use sms::SmsSender;

/// Timeout applied to every provider request
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Where a side-channel message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecipient {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ChannelRecipient {
    /// Address for `channel`, if the recipient has one
    pub fn address(&self, channel: DeliveryChannel) -> Option<&str> {
        let address = match channel {
            DeliveryChannel::Email => self.email.as_deref(),
            DeliveryChannel::Sms => self.phone.as_deref(),
            DeliveryChannel::InApp => None,
        };
        address.filter(|a| !a.trim().is_empty())
    }
}

impl From<&User> for ChannelRecipient {
    fn from(user: &User) -> Self {
        Self {
            name: user.username.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
}

/// A provider that can push a message over one external channel
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> DeliveryChannel;

    /// Send once; a non-success provider response is `Error::Channel`
    async fn send(&self, recipient: &ChannelRecipient, message: &OutboundMessage) -> Result<()>;
}

/// Configured side-channel senders; absent ones are skipped
#[derive(Clone, Default)]
pub struct ChannelSet {
    pub email: Option<Arc<dyn ChannelSender>>,
    pub sms: Option<Arc<dyn ChannelSender>>,
}

impl ChannelSet {
    /// Build senders for every channel whose config is complete
    pub fn from_config(email: &EmailConfig, sms: &SmsConfig) -> Result<Self> {
        let email: Option<Arc<dyn ChannelSender>> = if email.is_enabled() {
            Some(Arc::new(EmailSender::new(email)?))
        } else {
            None
        };
        let sms: Option<Arc<dyn ChannelSender>> = if sms.is_enabled() {
            Some(Arc::new(SmsSender::new(sms)?))
        } else {
            None
        };
        Ok(Self { email, sms })
    }

    pub fn sender(&self, channel: DeliveryChannel) -> Option<&Arc<dyn ChannelSender>> {
        match channel {
            DeliveryChannel::Email => self.email.as_ref(),
            DeliveryChannel::Sms => self.sms.as_ref(),
            DeliveryChannel::InApp => None,
        }
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Send with up to `max_attempts` tries, waiting `attempt * backoff` between them
///
/// Returns the number of attempts made and the final result.
pub async fn send_with_retry(
    sender: &dyn ChannelSender,
    recipient: &ChannelRecipient,
    message: &OutboundMessage,
    max_attempts: u32,
    backoff: Duration,
) -> (u32, Result<()>) {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match sender.send(recipient, message).await {
            Ok(()) => {
                debug!("{} sent to {} on attempt {}", sender.channel(), recipient.name, attempt);
                return (attempt, Ok(()));
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    "{} to {} failed (attempt {}/{}): {}",
                    sender.channel(),
                    recipient.name,
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(retry_delay(backoff, attempt)).await;
                attempt += 1;
            }
            Err(e) => return (attempt, Err(e)),
        }
    }
}

/// Longest wait between two attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Linear backoff: attempt N waits N * backoff, capped
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt).min(MAX_RETRY_DELAY)
}
