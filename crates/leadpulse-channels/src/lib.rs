//! # LeadPulse Channels
//!
//! Outbound delivery for the automation engine. Every channel implements
//! [`ChannelDispatcher`](leadpulse_core::ChannelDispatcher) and maps provider failures onto
//! [`DispatchError::Retryable`](leadpulse_core::DispatchError) or `Permanent`
//! so the coordinator's retry policy stays channel-agnostic.
//!
//! | Channel | Transport |
//! |---------|-----------|
//! | webhook | JSON POST to the surrounding system |
//! | email | SMTP (lettre), content from the renderer |
//! | whatsapp | WhatsApp Business Cloud API, content from the renderer |
//! | log | dry run, nothing leaves the process |

pub mod classify;
pub mod email;
pub mod log;
pub mod renderer;
pub mod router;
pub mod score;
pub mod webhook;
pub mod whatsapp;

use std::sync::Arc;
use std::time::Duration;

use leadpulse_core::{LeadPulseConfig, LeadPulseError, MessageRenderer, Result, ScoreRecalculator};

pub use email::EmailDispatcher;
pub use log::LogDispatcher;
pub use renderer::HttpRenderer;
pub use router::ChannelRouter;
pub use score::HttpScoreRecalculator;
pub use webhook::WebhookDispatcher;
pub use whatsapp::WhatsAppDispatcher;

/// Build the channel router from config.
///
/// In dry-run mode every dispatch is logged. Email and WhatsApp need a
/// renderer endpoint to turn template references into content.
pub fn build_router(config: &LeadPulseConfig) -> Result<ChannelRouter> {
    let channels = &config.channels;
    if channels.dry_run {
        tracing::info!("🧪 Channels in dry-run mode, dispatches are only logged");
        return Ok(ChannelRouter::dry_run());
    }

    let mut router = ChannelRouter::new();
    let renderer: Option<Arc<dyn MessageRenderer>> = HttpRenderer::from_config(&config.renderer)?
        .map(|r| Arc::new(r) as Arc<dyn MessageRenderer>);
    let require_renderer = |channel: &str| {
        renderer.clone().ok_or_else(|| {
            LeadPulseError::Config(format!("channel '{channel}' requires renderer.endpoint"))
        })
    };

    if let Some(webhook) = channels.webhook.as_ref().filter(|c| c.enabled) {
        router.register(Arc::new(WebhookDispatcher::new(webhook)));
    }
    if let Some(email) = channels.email.as_ref().filter(|c| c.enabled) {
        router.register(Arc::new(EmailDispatcher::new(email, require_renderer("email")?)?));
    }
    if let Some(whatsapp) = channels.whatsapp.as_ref().filter(|c| c.enabled) {
        router.register(Arc::new(WhatsAppDispatcher::new(
            whatsapp,
            require_renderer("whatsapp")?,
        )));
    }

    if router.channels().is_empty() {
        tracing::warn!("⚠️ No channels enabled, every dispatch will fail permanently");
    } else if !router.channels().contains(&channels.default.as_str()) {
        tracing::warn!(
            "⚠️ Default channel '{}' is not enabled (enabled: {:?})",
            channels.default,
            router.channels()
        );
    }
    Ok(router)
}

/// Score hook from config, `None` when no endpoint is set.
pub fn build_score(config: &LeadPulseConfig) -> Result<Option<Arc<dyn ScoreRecalculator>>> {
    match config.score.endpoint.as_deref() {
        Some(endpoint) => {
            let score = HttpScoreRecalculator::new(endpoint)?;
            Ok(Some(Arc::new(score)))
        }
        None => Ok(None),
    }
}

/// Delay between score hook attempts.
pub fn score_retry_delay(config: &LeadPulseConfig) -> Duration {
    Duration::from_secs(config.score.retry_delay_secs)
}
