//! Twilio SMS sender (Messages API)

use async_trait::async_trait;
use chub_common::config::SmsConfig;
use chub_common::db::models::DeliveryChannel;
use chub_common::{Error, Result};
use tracing::debug;

use super::{http_client, ChannelRecipient, ChannelSender, OutboundMessage};

/// SMS bodies longer than this are truncated (10 concatenated segments)
pub const MAX_SMS_CHARS: usize = 1600;

pub struct SmsSender {
    account_sid: String,
    auth_token: String,
    from_number: String,
    endpoint: String,
    client: reqwest::Client,
}

impl SmsSender {
    pub fn new(config: &SmsConfig) -> Result<Self> {
        Ok(Self {
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            endpoint: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                config.base_url.trim_end_matches('/'),
                config.account_sid
            ),
            client: http_client()?,
        })
    }
}

/// SMS has no subject line; fold it into the body
fn sms_body(message: &OutboundMessage) -> String {
    let text = if message.subject.is_empty() {
        message.body.clone()
    } else {
        format!("{}: {}", message.subject, message.body)
    };
    text.chars().take(MAX_SMS_CHARS).collect()
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Sms
    }

    async fn send(&self, recipient: &ChannelRecipient, message: &OutboundMessage) -> Result<()> {
        let to = recipient
            .address(DeliveryChannel::Sms)
            .ok_or_else(|| Error::InvalidInput(format!("{} has no phone number", recipient.name)))?;

        let body = sms_body(message);
        let form = [
            ("To", to),
            ("From", self.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        debug!("Twilio: sending {} chars to {}", body.chars().count(), to);

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Twilio request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "Twilio returned {}: {}",
                status,
                detail.trim()
            )));
        }
        Ok(())
    }
}
