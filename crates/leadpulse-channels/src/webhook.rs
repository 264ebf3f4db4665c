//! Webhook channel: hands the dispatch request to the surrounding system.
//!
//! The receiver renders and delivers the message itself. The execution id is
//! sent as `Idempotency-Key` so a retried attempt can be dropped downstream.

use std::collections::BTreeMap;

use async_trait::async_trait;
use leadpulse_core::config::WebhookChannelConfig;
use leadpulse_core::{ChannelDispatcher, DispatchError, DispatchReceipt, DispatchRequest};

use crate::classify::{classify_status, classify_transport};

pub struct WebhookDispatcher {
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookChannelConfig) -> Self {
        Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelDispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_token)
            .json(request);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let response = req.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let provider_message_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["message_id"].as_str().map(str::to_string));
        tracing::debug!("Webhook accepted {} ({status})", request.execution_id);
        Ok(DispatchReceipt { provider_message_id })
    }
}
