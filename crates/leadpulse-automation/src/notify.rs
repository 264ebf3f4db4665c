//! Side effects of execution outcomes: score recalculation and operator alerts.
//!
//! The coordinator never waits on these: outcomes are pushed onto an
//! unbounded channel and a [`SideEffectWorker`] consumes them in the
//! background. A failing score hook or alert webhook is logged and dropped;
//! it never changes an execution's state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use leadpulse_core::{ExecutionId, LeadId, ScoreRecalculator, SequenceId, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::execution::PendingExecution;

/// Outcome notifications emitted by the engine.
#[derive(Debug, Clone)]
pub enum AutomationEvent {
    Executed {
        execution: PendingExecution,
    },
    FailedTerminal {
        execution: PendingExecution,
        error: String,
    },
    Cancelled {
        tenant_id: TenantId,
        lead_id: LeadId,
        count: usize,
    },
}

/// Sending half handed to the coordinator and cancellation manager.
#[derive(Clone, Default)]
pub struct SideEffects {
    tx: Option<mpsc::UnboundedSender<AutomationEvent>>,
}

impl SideEffects {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AutomationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: AutomationEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::warn!("⚠️ Side-effect worker is gone, event dropped");
            }
        }
    }
}

/// A terminal dispatch failure surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub step_order_index: u32,
    pub channel: String,
    pub attempts: u32,
    pub error: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_execution(execution: &PendingExecution, error: &str, raised_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution.id.clone(),
            tenant_id: execution.tenant_id.clone(),
            lead_id: execution.lead_id.clone(),
            sequence_id: execution.sequence_id.clone(),
            step_order_index: execution.step_order_index,
            channel: execution.channel.clone(),
            attempts: execution.attempt_count,
            error: error.to_string(),
            raised_at,
        }
    }
}

/// Alert history (in-memory ring buffer).
pub struct AlertLog {
    limit: usize,
    history: Mutex<VecDeque<Alert>>,
}

impl AlertLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, alert: Alert) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(alert);
            while history.len() > self.limit {
                history.pop_front();
            }
        }
    }

    /// Most recent alerts, oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Consumes [`AutomationEvent`]s and runs their side effects.
pub struct SideEffectWorker {
    score: Option<Arc<dyn ScoreRecalculator>>,
    score_attempts: u32,
    score_retry_delay: std::time::Duration,
    alerts: Arc<AlertLog>,
    alert_webhook: Option<String>,
    http: reqwest::Client,
}

impl SideEffectWorker {
    pub fn new(alerts: Arc<AlertLog>) -> Self {
        Self {
            score: None,
            score_attempts: 3,
            score_retry_delay: std::time::Duration::from_secs(5),
            alerts,
            alert_webhook: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_score(
        mut self,
        score: Arc<dyn ScoreRecalculator>,
        attempts: u32,
        retry_delay: std::time::Duration,
    ) -> Self {
        self.score = Some(score);
        self.score_attempts = attempts.max(1);
        self.score_retry_delay = retry_delay;
        self
    }

    pub fn with_alert_webhook(mut self, url: Option<String>) -> Self {
        self.alert_webhook = url;
        self
    }

    /// Drain events until every sender is dropped, then wait for the
    /// side effects still in flight.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AutomationEvent>) {
        tracing::info!("🔔 Side-effect worker started");
        // Score retries sleep; keep them off the receive loop.
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let worker = Arc::clone(&self);
                        in_flight.spawn(async move { worker.handle(event).await });
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
            }
        }
        if !in_flight.is_empty() {
            tracing::info!("🔔 Waiting for {} side effect(s) to finish", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        tracing::info!("🔔 Side-effect worker stopped");
    }

    pub async fn handle(&self, event: AutomationEvent) {
        match event {
            AutomationEvent::Executed { execution } => {
                self.recompute_score(&execution.tenant_id, &execution.lead_id).await;
            }
            AutomationEvent::Cancelled {
                tenant_id,
                lead_id,
                count,
            } => {
                if count > 0 {
                    self.recompute_score(&tenant_id, &lead_id).await;
                }
            }
            AutomationEvent::FailedTerminal { execution, error } => {
                let alert = Alert::from_execution(&execution, &error, Utc::now());
                tracing::error!(
                    "🚨 Execution {} failed terminally after {} attempt(s): {}",
                    alert.execution_id,
                    alert.attempts,
                    alert.error
                );
                self.post_alert(&alert).await;
                self.alerts.record(alert);
            }
        }
    }

    async fn recompute_score(&self, tenant_id: &TenantId, lead_id: &LeadId) {
        let Some(score) = &self.score else {
            return;
        };
        for attempt in 1..=self.score_attempts {
            match score.recompute(tenant_id, lead_id).await {
                Ok(()) => {
                    tracing::debug!("🌡️ Score recomputed for {tenant_id}/{lead_id}");
                    return;
                }
                Err(e) if attempt < self.score_attempts => {
                    tracing::warn!(
                        "⚠️ Score recompute for {tenant_id}/{lead_id} failed (attempt {attempt}): {e}"
                    );
                    tokio::time::sleep(self.score_retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Score recompute for {tenant_id}/{lead_id} gave up after {attempt} attempt(s): {e}"
                    );
                }
            }
        }
    }

    async fn post_alert(&self, alert: &Alert) {
        let Some(url) = &self.alert_webhook else {
            return;
        };
        match self.http.post(url).json(alert).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!("⚠️ Alert webhook returned {}", resp.status()),
            Err(e) => tracing::warn!("⚠️ Alert webhook failed: {e}"),
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!("❌ Side effect task failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ActivationKey;
    use async_trait::async_trait;
    use leadpulse_core::{EventId, LeadPulseError};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyScore {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ScoreRecalculator for FlakyScore {
        async fn recompute(&self, _tenant: &TenantId, _lead: &LeadId) -> leadpulse_core::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(LeadPulseError::Score("scoring service down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn execution() -> PendingExecution {
        let key = ActivationKey::from_event(
            &TenantId::from("acme"),
            &LeadId::from("lead-1"),
            &SequenceId::from("nurture"),
            &EventId::from("evt-1"),
        );
        PendingExecution::new(&key, 0, "email", "welcome", Utc::now(), Utc::now())
    }

    #[test]
    fn test_alert_log_ring_buffer() {
        let log = AlertLog::new(2);
        for i in 0..3 {
            log.record(Alert::from_execution(&execution(), &format!("err-{i}"), Utc::now()));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].error, "err-1");
        assert_eq!(recent[1].error, "err-2");
    }

    #[tokio::test]
    async fn test_score_recompute_retries() {
        let score = Arc::new(FlakyScore {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let worker = SideEffectWorker::new(Arc::new(AlertLog::default())).with_score(
            score.clone(),
            3,
            std::time::Duration::from_millis(1),
        );
        worker
            .handle(AutomationEvent::Executed { execution: execution() })
            .await;
        assert_eq!(score.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_without_rows_skips_score() {
        let score = Arc::new(FlakyScore {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let worker = SideEffectWorker::new(Arc::new(AlertLog::default())).with_score(
            score.clone(),
            1,
            std::time::Duration::ZERO,
        );
        worker
            .handle(AutomationEvent::Cancelled {
                tenant_id: TenantId::from("acme"),
                lead_id: LeadId::from("lead-1"),
                count: 0,
            })
            .await;
        assert_eq!(score.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_records_alert() {
        let alerts = Arc::new(AlertLog::default());
        let worker = SideEffectWorker::new(alerts.clone());
        worker
            .handle(AutomationEvent::FailedTerminal {
                execution: execution(),
                error: "mailbox does not exist".into(),
            })
            .await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts.recent()[0].channel, "email");
    }

    struct SlowScore {
        done: AtomicU32,
    }

    #[async_trait]
    impl ScoreRecalculator for SlowScore {
        async fn recompute(&self, _tenant: &TenantId, _lead: &LeadId) -> leadpulse_core::Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_in_flight_effects() {
        let score = Arc::new(SlowScore { done: AtomicU32::new(0) });
        let worker = Arc::new(SideEffectWorker::new(Arc::new(AlertLog::default())).with_score(
            score.clone(),
            1,
            std::time::Duration::ZERO,
        ));
        let (effects, rx) = SideEffects::channel();
        effects.emit(AutomationEvent::Executed { execution: execution() });
        effects.emit(AutomationEvent::Cancelled {
            tenant_id: TenantId::from("acme"),
            lead_id: LeadId::from("lead-2"),
            count: 1,
        });
        drop(effects);

        worker.run(rx).await;
        assert_eq!(score.done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_side_effects_channel_delivers() {
        let (effects, mut rx) = SideEffects::channel();
        effects.emit(AutomationEvent::Cancelled {
            tenant_id: TenantId::from("acme"),
            lead_id: LeadId::from("lead-1"),
            count: 2,
        });
        assert!(matches!(rx.recv().await, Some(AutomationEvent::Cancelled { count: 2, .. })));
        SideEffects::disabled().emit(AutomationEvent::Executed { execution: execution() });
    }
}
