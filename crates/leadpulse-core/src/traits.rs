//! Collaborator interfaces. Implementations live outside the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DispatchError, Result};
use crate::types::{DispatchReceipt, DispatchRequest, LeadId, RenderedMessage, TenantId};

/// Sends one step's message over a named channel.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    /// Channel name, e.g. "email", "whatsapp", "webhook".
    fn name(&self) -> &str;

    async fn dispatch(&self, request: &DispatchRequest) -> std::result::Result<DispatchReceipt, DispatchError>;
}

/// Recomputes and persists a lead's temperature score.
///
/// Invoked fire-and-forget after automation events; the engine never waits
/// on it from the dispatch path.
#[async_trait]
pub trait ScoreRecalculator: Send + Sync {
    async fn recompute(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<()>;
}

/// Reads named anchor timestamps from a lead's context.
pub trait LeadContextSource: Send + Sync {
    fn anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Turns a template reference into concrete content for a lead.
#[async_trait]
pub trait MessageRenderer: Send + Sync {
    async fn render(&self, request: &DispatchRequest) -> Result<RenderedMessage>;
}
