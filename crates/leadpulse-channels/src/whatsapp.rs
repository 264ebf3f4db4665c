//! WhatsApp Business Cloud API channel.
//!
//! Requires an access token and a phone number id from Meta Business Suite.
//! The renderer supplies the lead's phone number as the recipient.

use std::sync::Arc;

use async_trait::async_trait;
use leadpulse_core::config::WhatsAppChannelConfig;
use leadpulse_core::{ChannelDispatcher, DispatchError, DispatchReceipt, DispatchRequest, MessageRenderer};

use crate::classify::{classify_status, classify_transport};

const GRAPH_BASE: &str = "https://graph.facebook.com";

pub struct WhatsAppDispatcher {
    config: WhatsAppChannelConfig,
    base_url: String,
    renderer: Arc<dyn MessageRenderer>,
    client: reqwest::Client,
}

impl WhatsAppDispatcher {
    pub fn new(config: &WhatsAppChannelConfig, renderer: Arc<dyn MessageRenderer>) -> Self {
        Self {
            config: config.clone(),
            base_url: GRAPH_BASE.to_string(),
            renderer,
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different Graph API host.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.config.api_version, self.config.phone_number_id
        )
    }
}

#[async_trait]
impl ChannelDispatcher for WhatsAppDispatcher {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let rendered = self.renderer.render(request).await?;
        let to: String = rendered
            .recipient
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if to.is_empty() {
            return Err(DispatchError::Permanent(format!(
                "invalid WhatsApp recipient '{}'",
                rendered.recipient
            )));
        }

        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": rendered.body
            }
        });

        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let msg_id = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["messages"][0]["id"].as_str().map(str::to_string));
        tracing::debug!("WhatsApp message sent: {:?} → {}", msg_id, to);
        Ok(DispatchReceipt {
            provider_message_id: msg_id,
        })
    }
}
