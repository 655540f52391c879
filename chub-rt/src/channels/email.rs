//! SendGrid email sender (v3 mail/send API)

use async_trait::async_trait;
use chub_common::config::EmailConfig;
use chub_common::db::models::DeliveryChannel;
use chub_common::{Error, Result};
use serde_json::json;
use tracing::debug;

use super::{http_client, ChannelRecipient, ChannelSender, OutboundMessage};

pub struct EmailSender {
    api_key: String,
    from_address: String,
    endpoint: String,
    client: reqwest::Client,
}

impl EmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        Ok(Self {
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
            endpoint: format!("{}/v3/mail/send", config.base_url.trim_end_matches('/')),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Email
    }

    async fn send(&self, recipient: &ChannelRecipient, message: &OutboundMessage) -> Result<()> {
        let to = recipient
            .address(DeliveryChannel::Email)
            .ok_or_else(|| Error::InvalidInput(format!("{} has no email address", recipient.name)))?;

        let payload = json!({
            "personalizations": [{
                "to": [{ "email": to, "name": recipient.name }]
            }],
            "from": { "email": self.from_address },
            "subject": message.subject,
            "content": [{ "type": "text/plain", "value": message.body }]
        });

        debug!("SendGrid: sending \"{}\" to {}", message.subject, to);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("SendGrid request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "SendGrid returned {}: {}",
                status,
                detail.trim()
            )));
        }
        Ok(())
    }
}
