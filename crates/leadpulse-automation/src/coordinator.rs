//! Execution coordinator: claims due executions and dispatches them.
//!
//! Every pass first reclaims expired leases, then loads a batch of due
//! executions. Executions of one sequence instance run one after another so
//! step N is never sent after step N+1; different instances run concurrently
//! up to `max_in_flight`. All status changes go through the store's
//! compare-and-set operations, so several workers can share one store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use leadpulse_core::{ChannelDispatcher, DispatchError, DispatchRequest, ExecutionId, LeadPulseConfig, Result};

use crate::execution::{ClaimOutcome, ExecutionStatus, FailureTransition, InstanceKey, PendingExecution};
use crate::notify::{AutomationEvent, SideEffects};
use crate::retry::RetryPolicy;
use crate::store::ExecutionStore;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub worker_id: String,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub lease_ttl: chrono::Duration,
    pub dispatch_timeout: std::time::Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&LeadPulseConfig::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &LeadPulseConfig) -> Self {
        let worker = &config.worker;
        Self {
            worker_id: worker
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])),
            batch_size: worker.batch_size.max(1),
            max_in_flight: worker.max_in_flight.max(1),
            lease_ttl: chrono::Duration::seconds(worker.lease_ttl_secs as i64),
            dispatch_timeout: worker.dispatch_timeout(),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// What happened to one execution in a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    Executed,
    Retried { next_fire_at: DateTime<Utc> },
    FailedTerminal,
    /// The claim was lost, or the execution was not eligible.
    Skipped,
    /// Dispatch ran but our lease had been reclaimed; the new owner decides.
    LeaseLost,
}

/// Counters for one coordinator pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub reclaimed: usize,
    pub executed: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PassReport {
    fn tally(&mut self, outcome: &ExecuteOutcome) {
        match outcome {
            ExecuteOutcome::Executed => self.executed += 1,
            ExecuteOutcome::Retried { .. } => self.retried += 1,
            ExecuteOutcome::FailedTerminal => self.failed += 1,
            ExecuteOutcome::Skipped | ExecuteOutcome::LeaseLost => self.skipped += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == PassReport::default()
    }
}

pub struct ExecutionCoordinator {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<dyn ChannelDispatcher>,
    effects: SideEffects,
    settings: CoordinatorSettings,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        dispatcher: Arc<dyn ChannelDispatcher>,
        effects: SideEffects,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            effects,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// One scheduling pass at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport {
            reclaimed: self.reclaim_expired(now)?,
            ..Default::default()
        };

        let due = self.store.due(now, self.settings.batch_size)?;
        if due.is_empty() {
            return Ok(report);
        }

        // Group per instance; inside a group steps go in step order, since a
        // retried step is due later than the steps it still blocks.
        let mut groups: Vec<Vec<(u32, ExecutionId)>> = Vec::new();
        let mut index: HashMap<InstanceKey, usize> = HashMap::new();
        for exec in &due {
            let slot = *index.entry(exec.instance()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push((exec.step_order_index, exec.id.clone()));
        }
        for group in &mut groups {
            group.sort_by_key(|(step, _)| *step);
        }

        let outcomes: Vec<Vec<ExecuteOutcome>> = futures::stream::iter(groups)
            .map(|group| async move {
                let mut outcomes = Vec::with_capacity(group.len());
                for (_, id) in group {
                    match self.execute_one(&id, now).await {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(e) => {
                            tracing::error!("❌ Execution {id} could not be processed: {e}");
                            outcomes.push(ExecuteOutcome::Skipped);
                        }
                    }
                }
                outcomes
            })
            .buffer_unordered(self.settings.max_in_flight)
            .collect()
            .await;

        for outcome in outcomes.iter().flatten() {
            report.tally(outcome);
        }
        if !report.is_idle() {
            tracing::info!(
                "⚙️ [{}] pass: {} sent, {} retried, {} failed, {} skipped, {} reclaimed",
                self.settings.worker_id,
                report.executed,
                report.retried,
                report.failed,
                report.skipped,
                report.reclaimed
            );
        }
        Ok(report)
    }

    /// Claim, dispatch and resolve one execution.
    pub async fn execute_one(&self, id: &ExecutionId, now: DateTime<Utc>) -> Result<ExecuteOutcome> {
        let exec = match self.store.claim(id, now, self.settings.lease_ttl)? {
            ClaimOutcome::Claimed(exec) => exec,
            other => {
                tracing::debug!("Claim of {id} skipped: {other:?}");
                return Ok(ExecuteOutcome::Skipped);
            }
        };
        let token = exec.lease_token.clone().unwrap_or_default();

        let request = DispatchRequest {
            execution_id: exec.id.clone(),
            tenant_id: exec.tenant_id.clone(),
            lead_id: exec.lead_id.clone(),
            sequence_id: exec.sequence_id.clone(),
            step_order_index: exec.step_order_index,
            channel: exec.channel.clone(),
            template_ref: exec.template_ref.clone(),
            idempotency_token: exec.id.to_string(),
            attempt: exec.attempt_count + 1,
        };

        let timeout = self.settings.dispatch_timeout;
        let result = tokio::time::timeout(timeout, self.dispatcher.dispatch(&request))
            .await
            .unwrap_or(Err(DispatchError::Timeout(timeout)));

        match result {
            Ok(receipt) => {
                if !self.store.complete(id, &token, now)? {
                    tracing::warn!("⚠️ Lease on {id} was lost before completion");
                    return Ok(ExecuteOutcome::LeaseLost);
                }
                tracing::info!(
                    "📨 Sent step {} of '{}' to lead {} via {}{}",
                    exec.step_order_index,
                    exec.sequence_id,
                    exec.lead_id,
                    exec.channel,
                    receipt
                        .provider_message_id
                        .map(|m| format!(" ({m})"))
                        .unwrap_or_default()
                );
                let mut done = exec;
                done.status = ExecutionStatus::Executed;
                done.lease_token = None;
                done.finished_at = Some(now);
                self.effects.emit(AutomationEvent::Executed { execution: done });
                Ok(ExecuteOutcome::Executed)
            }
            Err(e) => self.fail(&exec, &token, &e, now),
        }
    }

    fn fail(
        &self,
        exec: &PendingExecution,
        token: &str,
        error: &DispatchError,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let failures = exec.attempt_count + 1;
        let transition = self
            .settings
            .retry
            .decide(failures, error.is_retryable(), now);
        let message = error.to_string();

        let Some(row) = self
            .store
            .record_failure(&exec.id, token, transition, &message, now)?
        else {
            tracing::warn!("⚠️ Lease on {} was lost before recording failure", exec.id);
            return Ok(ExecuteOutcome::LeaseLost);
        };

        Ok(match transition {
            FailureTransition::Retry { next_fire_at } => {
                tracing::warn!(
                    "⚠️ Dispatch of {} failed (attempt {failures}), retrying at {next_fire_at}: {message}",
                    exec.id
                );
                ExecuteOutcome::Retried { next_fire_at }
            }
            FailureTransition::Terminal => {
                tracing::error!(
                    "❌ Dispatch of {} failed terminally after {failures} attempt(s): {message}",
                    exec.id
                );
                self.effects.emit(AutomationEvent::FailedTerminal {
                    execution: row,
                    error: message,
                });
                ExecuteOutcome::FailedTerminal
            }
        })
    }

    /// Treat every expired lease as a retryable failure. Any worker may do this.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.expired_leases(now, self.settings.batch_size)?;
        let mut reclaimed = 0;
        for exec in expired {
            let Some(token) = exec.lease_token.clone() else {
                continue;
            };
            let transition = self.settings.retry.decide(exec.attempt_count + 1, true, now);
            let message = "lease expired before the dispatch was resolved";
            match self.store.record_failure(&exec.id, &token, transition, message, now)? {
                Some(row) => {
                    reclaimed += 1;
                    tracing::warn!("⚠️ Reclaimed expired lease on {} ({})", row.id, row.status);
                    if row.status == ExecutionStatus::FailedTerminal {
                        self.effects.emit(AutomationEvent::FailedTerminal {
                            execution: row,
                            error: message.to_string(),
                        });
                    }
                }
                None => tracing::debug!("Expired lease on {} already resolved", exec.id),
            }
        }
        Ok(reclaimed)
    }
}
