//! Automation engine: wires the components together and runs them.
//!
//! Each lifecycle event flows: anchor projection → cancellation → trigger
//! evaluation → step scheduling. The background loop drains the event inbox,
//! runs coordinator passes, sweeps time ticks and stops on a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadpulse_core::{
    ChannelDispatcher, LeadContextSource, LeadPulseConfig, LeadPulseError, LifecycleEvent,
    LifecycleKind, Result,
};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::cancellation::CancellationManager;
use crate::catalog::{MemoryCatalog, SequenceCatalog};
use crate::context::{AnchorProjection, MemoryAnchors};
use crate::coordinator::{CoordinatorSettings, ExecutionCoordinator, PassReport};
use crate::inbox::EventInbox;
use crate::notify::SideEffects;
use crate::persistence::AutomationDb;
use crate::scheduler::StepScheduler;
use crate::store::{ExecutionStore, MemoryExecutionStore};
use crate::trigger::TriggerEvaluator;

/// Storage and collaborators the engine runs against.
pub struct EngineDeps {
    pub catalog: Arc<dyn SequenceCatalog>,
    pub store: Arc<dyn ExecutionStore>,
    pub context: Arc<dyn LeadContextSource>,
    pub anchors: Arc<dyn AnchorProjection>,
    pub dispatcher: Arc<dyn ChannelDispatcher>,
}

impl EngineDeps {
    /// Everything in memory. For embedding and tests.
    pub fn in_memory(dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        let anchors = Arc::new(MemoryAnchors::new());
        Self {
            catalog: Arc::new(MemoryCatalog::new()),
            store: Arc::new(MemoryExecutionStore::new()),
            context: anchors.clone(),
            anchors,
            dispatcher,
        }
    }

    /// Everything in one SQLite database.
    pub fn sqlite(db: Arc<AutomationDb>, dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        Self {
            catalog: db.clone(),
            store: db.clone(),
            context: db.clone(),
            anchors: db,
            dispatcher,
        }
    }
}

/// Counters for one handled lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventReport {
    pub cancelled: usize,
    pub activations: usize,
    pub scheduled: usize,
    pub skipped_steps: usize,
    /// Activations that failed with a configuration error.
    pub misconfigured: usize,
}

pub struct AutomationEngine {
    store: Arc<dyn ExecutionStore>,
    anchors: Arc<dyn AnchorProjection>,
    evaluator: TriggerEvaluator,
    scheduler: StepScheduler,
    coordinator: ExecutionCoordinator,
    cancellation: CancellationManager,
    wake: Arc<Notify>,
}

impl AutomationEngine {
    pub fn new(
        deps: EngineDeps,
        settings: CoordinatorSettings,
        default_channel: &str,
        effects: SideEffects,
    ) -> Self {
        let EngineDeps {
            catalog,
            store,
            context,
            anchors,
            dispatcher,
        } = deps;
        Self {
            evaluator: TriggerEvaluator::new(catalog.clone(), context, store.clone()),
            scheduler: StepScheduler::new(store.clone(), default_channel),
            coordinator: ExecutionCoordinator::new(store.clone(), dispatcher, effects.clone(), settings),
            cancellation: CancellationManager::new(store.clone(), catalog, effects),
            store,
            anchors,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Build from config with the given storage and side-effect channel.
    pub fn from_config(
        config: &LeadPulseConfig,
        deps: EngineDeps,
        effects: SideEffects,
    ) -> Self {
        Self::new(
            deps,
            CoordinatorSettings::from_config(config),
            &config.channels.default,
            effects,
        )
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.coordinator.settings().worker_id
    }

    /// Process one lifecycle event.
    ///
    /// A misconfigured sequence fails only its own activation; the others
    /// for the same event still schedule.
    pub async fn handle_event(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> Result<EventReport> {
        // Ticks are synthetic and never cancel; their activations dedup on their own.
        let tracked = !matches!(event.kind, LifecycleKind::TimeTick { .. });
        if tracked
            && self
                .store
                .event_handled(&event.tenant_id, &event.lead_id, &event.event_id)?
        {
            tracing::debug!(
                "🔁 Event {} for lead {} already handled, skipping",
                event.event_id,
                event.lead_id
            );
            return Ok(EventReport::default());
        }

        if let LifecycleKind::ContextUpdated { anchor, value } = &event.kind {
            self.anchors
                .record_anchor(&event.tenant_id, &event.lead_id, anchor, *value)?;
        }

        let mut report = EventReport {
            cancelled: self.cancellation.apply(event, now)?.len(),
            ..Default::default()
        };

        let activations = self.evaluator.evaluate(event)?;
        report.activations = activations.len();
        let mut any_due = false;
        for activation in &activations {
            match self.scheduler.schedule(activation, now) {
                Ok(outcome) => {
                    any_due |= outcome.created.iter().any(|e| e.is_due(now));
                    report.scheduled += outcome.created.len();
                    report.skipped_steps += outcome.skipped_steps.len();
                }
                Err(e @ LeadPulseError::Configuration { .. }) => {
                    tracing::error!("❌ Activation for lead {} rejected: {e}", activation.key.lead_id);
                    report.misconfigured += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if tracked {
            self.store
                .mark_event_handled(&event.tenant_id, &event.lead_id, &event.event_id, now)?;
        }
        if any_due {
            self.wake.notify_one();
        }
        Ok(report)
    }

    /// One coordinator pass.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<PassReport> {
        self.coordinator.run_due(now).await
    }

    /// Emit a TIME_TICK for every lead with a known anchor. Returns the
    /// number of new activations.
    pub async fn sweep_time_ticks(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut activations = 0;
        for (tenant_id, lead_id) in self.anchors.anchored_leads()? {
            let tick = LifecycleEvent::time_tick(&tenant_id, &lead_id, now);
            match self.handle_event(&tick, now).await {
                Ok(report) => activations += report.activations,
                Err(e) => tracing::warn!("⚠️ Time tick for {tenant_id}/{lead_id} failed: {e}"),
            }
        }
        if activations > 0 {
            tracing::info!("⏰ Time tick sweep activated {activations} sequence(s)");
        }
        Ok(activations)
    }

    /// Claim and process a batch of inbox events. Returns how many were handled.
    ///
    /// A store failure leaves the event claimed so it is retried once the
    /// claim goes stale; any other failure is recorded on the event.
    pub async fn drain_inbox(
        &self,
        inbox: &dyn EventInbox,
        now: DateTime<Utc>,
        limit: usize,
        stale_after: chrono::Duration,
    ) -> Result<usize> {
        let batch = inbox.claim_batch(self.worker_id(), now, limit, stale_after)?;
        let handled = batch.len();
        for entry in batch {
            match self.handle_event(&entry.event, now).await {
                Ok(report) => {
                    tracing::debug!("Event #{} ({}) handled: {report:?}", entry.seq, entry.event.kind.label());
                    inbox.mark_processed(entry.seq, None, now)?;
                }
                Err(e @ LeadPulseError::Store(_)) => {
                    tracing::warn!("⚠️ Event #{} left for retry: {e}", entry.seq);
                }
                Err(e) => {
                    tracing::error!("❌ Event #{} failed: {e}", entry.seq);
                    inbox.mark_processed(entry.seq, Some(&e.to_string()), now)?;
                }
            }
        }
        Ok(handled)
    }
}

/// Timing for the background loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub event_batch_size: usize,
    /// Inbox claims older than this are taken over by another worker.
    pub stale_after: chrono::Duration,
}

impl LoopSettings {
    pub fn from_config(config: &LeadPulseConfig) -> Self {
        let worker = &config.worker;
        Self {
            poll_interval: worker.poll_interval(),
            tick_interval: worker.tick_interval(),
            event_batch_size: worker.event_batch_size.max(1),
            stale_after: chrono::Duration::seconds(worker.lease_ttl_secs as i64),
        }
    }
}

/// Spawn the engine loop. It returns after `shutdown` flips to `true` or
/// its sender is dropped; a pass already running finishes first.
pub fn spawn_engine(
    engine: Arc<AutomationEngine>,
    inbox: Arc<dyn EventInbox>,
    settings: LoopSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "⏰ Automation engine '{}' started (poll every {:?}, tick every {:?})",
            engine.worker_id(),
            settings.poll_interval,
            settings.tick_interval
        );
        let mut poll = tokio::time::interval(settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval(settings.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let wake = engine.wake.clone();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let now = Utc::now();
                    if let Err(e) = engine
                        .drain_inbox(inbox.as_ref(), now, settings.event_batch_size, settings.stale_after)
                        .await
                    {
                        tracing::warn!("⚠️ Inbox drain failed: {e}");
                    }
                    if let Err(e) = engine.run_due(Utc::now()).await {
                        tracing::warn!("⚠️ Coordinator pass failed: {e}");
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = engine.sweep_time_ticks(Utc::now()).await {
                        tracing::warn!("⚠️ Time tick sweep failed: {e}");
                    }
                }
                _ = wake.notified() => {
                    if let Err(e) = engine.run_due(Utc::now()).await {
                        tracing::warn!("⚠️ Coordinator pass failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("🛑 Automation engine '{}' stopped", engine.worker_id());
    })
}
