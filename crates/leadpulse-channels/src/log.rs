//! Dry-run channel: logs the dispatch and reports success.

use async_trait::async_trait;
use leadpulse_core::{ChannelDispatcher, DispatchError, DispatchReceipt, DispatchRequest};

pub struct LogDispatcher {
    name: String,
}

impl LogDispatcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Default for LogDispatcher {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl ChannelDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        tracing::info!(
            "📣 [dry-run] {} → lead {} ({}/{}), template '{}', step {} of '{}', attempt {}",
            request.channel,
            request.lead_id,
            request.tenant_id,
            request.execution_id,
            request.template_ref,
            request.step_order_index,
            request.sequence_id,
            request.attempt
        );
        Ok(DispatchReceipt {
            provider_message_id: Some(format!("dry-run-{}", request.execution_id)),
        })
    }
}
