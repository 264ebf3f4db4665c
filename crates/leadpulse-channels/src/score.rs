//! HTTP hook that asks the surrounding system to recompute a lead's score.

use std::time::Duration;

use async_trait::async_trait;
use leadpulse_core::{LeadId, LeadPulseError, Result, ScoreRecalculator, TenantId};

pub struct HttpScoreRecalculator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpScoreRecalculator {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LeadPulseError::Config(format!("score client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ScoreRecalculator for HttpScoreRecalculator {
    async fn recompute(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "tenant_id": tenant_id,
                "lead_id": lead_id,
            }))
            .send()
            .await
            .map_err(|e| LeadPulseError::Score(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(LeadPulseError::Score(format!(
                "score endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
