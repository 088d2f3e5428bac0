//! Twilio Messages API gateway.

use super::MessagingGateway;
use crate::config::MessagingConfig;
use crate::error::PipelineResult;
use crate::http::status_error;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default)]
struct MessageResource {
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    num_media: Option<String>,
}

pub struct TwilioGateway {
    client: reqwest::Client,
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from_address: String,
}

impl TwilioGateway {
    pub fn new(client: reqwest::Client, config: &MessagingConfig) -> Self {
        Self {
            client,
            messages_url: format!(
                "{}/Accounts/{}/Messages.json",
                config.api_base.trim_end_matches('/'),
                config.account_sid
            ),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_address: config.from_address.clone(),
        }
    }

    /// Recipient address on the same channel as the sender, e.g.
    /// `whatsapp:+201234567890` when sending from `whatsapp:+14155238886`.
    pub fn recipient_address(&self, user_key: &str) -> String {
        match self.from_address.split_once(':') {
            Some((channel, _)) => format!("{}:{}", channel, user_key),
            None => user_key.to_string(),
        }
    }

    async fn post(&self, form: &[(&str, &str)]) -> PipelineResult<MessageResource> {
        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("messaging", status, &body));
        }
        Ok(response.json().await.unwrap_or_default())
    }
}

#[async_trait]
impl MessagingGateway for TwilioGateway {
    async fn send_text(&self, user_key: &str, body: &str) -> PipelineResult<()> {
        let to = self.recipient_address(user_key);
        let resource = self
            .post(&[("From", self.from_address.as_str()), ("To", to.as_str()), ("Body", body)])
            .await?;
        info!(
            message_sid = resource.sid.as_deref().unwrap_or("unknown"),
            chars = body.chars().count(),
            "Sent text message"
        );
        Ok(())
    }

    async fn send_audio(&self, user_key: &str, media_url: &str) -> PipelineResult<()> {
        let to = self.recipient_address(user_key);
        // Voice notes carry only MediaUrl; a Body would turn it into a captioned file
        let resource = self
            .post(&[("From", self.from_address.as_str()), ("To", to.as_str()), ("MediaUrl", media_url)])
            .await?;

        if resource.num_media.as_deref() == Some("0") {
            warn!(media_url, "Gateway accepted the message but attached no media; is the URL public?");
        } else {
            info!(message_sid = resource.sid.as_deref().unwrap_or("unknown"), "Sent audio message");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_url_and_recipient() {
        let mut config = crate::config::AppConfig::default().messaging;
        config.account_sid = "AC123".to_string();
        let gateway = TwilioGateway::new(reqwest::Client::new(), &config);

        assert_eq!(
            gateway.messages_url,
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
        assert_eq!(gateway.recipient_address("+201234567890"), "whatsapp:+201234567890");

        config.from_address = "+14155238886".to_string();
        let sms = TwilioGateway::new(reqwest::Client::new(), &config);
        assert_eq!(sms.recipient_address("+201234567890"), "+201234567890");
    }
}
