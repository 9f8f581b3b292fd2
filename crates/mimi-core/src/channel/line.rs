use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::channel::MessagingChannel;
use crate::config::LineConfig;
use crate::error::ChannelError;
use crate::util::http::client;

/// LINE Messaging API channel.
pub struct LineChannel {
    config: LineConfig,
}

impl LineChannel {
    pub fn new(config: LineConfig) -> Self {
        Self { config }
    }

    fn access_token(&self) -> Result<&str, ChannelError> {
        if self.config.channel_access_token.is_empty() {
            return Err(ChannelError::NotConfigured("LINE channel access token"));
        }
        Ok(&self.config.channel_access_token)
    }

    fn reply_url(&self) -> String {
        format!("{}/v2/bot/message/reply", self.config.api_base.trim_end_matches('/'))
    }

    fn content_url(&self, message_id: &str) -> String {
        format!(
            "{}/v2/bot/message/{}/content",
            self.config.data_api_base.trim_end_matches('/'),
            message_id
        )
    }

    /// Verify the `x-line-signature` header: base64 HMAC-SHA256 of the raw
    /// body keyed by the channel secret.
    pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
        #[cfg(feature = "http-api")]
        {
            use base64::Engine;
            use hmac::{Hmac, Mac};
            use sha2::Sha256;

            type HmacSha256 = Hmac<Sha256>;

            let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        #[cfg(not(feature = "http-api"))]
        {
            let _ = (channel_secret, body, signature);
            false
        }
    }

    /// Parse LINE webhook events from the request body.
    pub fn parse_webhook_events(body: &str) -> Result<Vec<LineEvent>, serde_json::Error> {
        let webhook: LineWebhook = serde_json::from_str(body)?;
        Ok(webhook.events)
    }
}

#[async_trait]
impl MessagingChannel for LineChannel {
    fn name(&self) -> &str {
        "line"
    }

    /// Reply using the event's reply token. LINE only accepts a token once
    /// and only shortly after the webhook.
    async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ChannelError> {
        let token = self.access_token()?;
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [{
                "type": "text",
                "text": text
            }]
        });

        let resp = client()
            .post(self.reply_url())
            .header("Authorization", format!("Bearer {token}"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!("LINE reply API error: {} {}", status, text);
            return Err(ChannelError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!("LINE reply sent successfully");
        Ok(())
    }

    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>, ChannelError> {
        let token = self.access_token()?;
        let resp = client()
            .get(self.content_url(message_id))
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!("LINE content API error for {}: {} {}", message_id, status, text);
            return Err(ChannelError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let bytes = resp.bytes().await?;
        debug!("Fetched {} bytes of content for message {}", bytes.len(), message_id);
        Ok(bytes.to_vec())
    }
}

// ====== LINE Webhook Types ======

#[derive(Debug, Deserialize)]
pub struct LineWebhook {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<LineEvent>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reply_token: Option<String>,
    pub source: Option<LineSource>,
    pub message: Option<LineMessage>,
    pub timestamp: Option<u64>,
}

impl LineEvent {
    pub fn user_id(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|s| s.user_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn reply_token(&self) -> Option<&str> {
        self.reply_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMessage {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub text: Option<String>,
}
