//! HTTP template renderer.
//!
//! Posts the dispatch request to the surrounding system, which resolves the
//! lead's contact details and the template and answers with a
//! [`RenderedMessage`].

use std::time::Duration;

use async_trait::async_trait;
use leadpulse_core::config::RendererConfig;
use leadpulse_core::{DispatchRequest, LeadPulseError, MessageRenderer, RenderedMessage, Result};
use reqwest::StatusCode;

pub struct HttpRenderer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LeadPulseError::Config(format!("renderer client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &RendererConfig) -> Result<Option<Self>> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, Duration::from_secs(config.timeout_secs)))
            .transpose()
    }
}

#[async_trait]
impl MessageRenderer for HttpRenderer {
    async fn render(&self, request: &DispatchRequest) -> Result<RenderedMessage> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| LeadPulseError::Channel(format!("renderer request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let message: RenderedMessage = response
                .json()
                .await
                .map_err(|e| LeadPulseError::Render(format!("invalid renderer response: {e}")))?;
            if message.recipient.trim().is_empty() {
                return Err(LeadPulseError::Render(format!(
                    "no recipient for lead {} on {}",
                    request.lead_id, request.channel
                )));
            }
            return Ok(message);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => LeadPulseError::NotFound(format!(
                "template '{}' or lead {}: {body}",
                request.template_ref, request.lead_id
            )),
            s if s.is_client_error() && s != StatusCode::TOO_MANY_REQUESTS => {
                LeadPulseError::Render(format!("renderer rejected '{}' ({s}): {body}", request.template_ref))
            }
            s => LeadPulseError::Channel(format!("renderer returned {s}: {body}")),
        })
    }
}
