//! Cancellation of pending steps when a lead leaves a sequence's context.
//!
//! Only `PENDING` executions are touched. An execution already claimed is in
//! flight and resolves on its own; the store's compare-and-set decides the
//! race, so `CANCELLED` always means nothing was sent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadpulse_core::{LeadId, LifecycleEvent, LifecycleKind, Result, TenantId};

use crate::catalog::SequenceCatalog;
use crate::execution::{CancelFilter, PendingExecution, anchor_cause};
use crate::notify::{AutomationEvent, SideEffects};
use crate::sequence::{SequenceDefinition, Trigger};
use crate::store::ExecutionStore;

pub struct CancellationManager {
    store: Arc<dyn ExecutionStore>,
    catalog: Arc<dyn SequenceCatalog>,
    effects: SideEffects,
}

impl CancellationManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn SequenceCatalog>,
        effects: SideEffects,
    ) -> Self {
        Self {
            store,
            catalog,
            effects,
        }
    }

    /// Cancel whatever `event` takes the lead out of. Returns the cancelled rows.
    pub fn apply(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> Result<Vec<PendingExecution>> {
        let tenant = &event.tenant_id;
        let lead = &event.lead_id;

        let filters: Vec<CancelFilter> = match &event.kind {
            LifecycleKind::StageChanged { to, .. } => self
                .pending_definitions(tenant, lead)?
                .into_iter()
                .filter(|def| def.cancellation.cancels_on_stage(&def.trigger, to))
                .map(|def| CancelFilter::sequence(tenant, lead, &def.id))
                .collect(),
            LifecycleKind::Converted => self
                .pending_definitions(tenant, lead)?
                .into_iter()
                .filter(|def| def.cancellation.on_conversion)
                .map(|def| CancelFilter::sequence(tenant, lead, &def.id))
                .collect(),
            LifecycleKind::Lost { .. } => self
                .pending_definitions(tenant, lead)?
                .into_iter()
                .filter(|def| def.cancellation.on_loss)
                .map(|def| CancelFilter::sequence(tenant, lead, &def.id))
                .collect(),
            // Manual stop ignores policy.
            LifecycleKind::Stopped {
                sequence_id: Some(sequence_id),
            } => vec![CancelFilter::sequence(tenant, lead, sequence_id)],
            LifecycleKind::Stopped { sequence_id: None } => vec![CancelFilter::lead(tenant, lead)],
            LifecycleKind::ContextUpdated { anchor, value } => {
                let keep = value.map(|v| anchor_cause(anchor, v));
                self.pending_definitions(tenant, lead)?
                    .into_iter()
                    .filter(|def| {
                        def.cancellation.on_anchor_change
                            && matches!(&def.trigger, Trigger::TimeAnchored { anchor: a } if a == anchor)
                    })
                    .map(|def| CancelFilter::sequence(tenant, lead, &def.id).keeping(keep.clone()))
                    .collect()
            }
            LifecycleKind::TimeTick { .. } => Vec::new(),
        };

        let mut cancelled = Vec::new();
        for filter in &filters {
            cancelled.extend(self.store.cancel_pending(filter, now)?);
        }

        if !cancelled.is_empty() {
            tracing::info!(
                "🛑 Cancelled {} pending step(s) for lead {} on {}",
                cancelled.len(),
                lead,
                event.kind.label()
            );
            self.effects.emit(AutomationEvent::Cancelled {
                tenant_id: tenant.clone(),
                lead_id: lead.clone(),
                count: cancelled.len(),
            });
        }
        Ok(cancelled)
    }

    /// Definitions of every sequence with pending steps for the lead.
    fn pending_definitions(&self, tenant: &TenantId, lead: &LeadId) -> Result<Vec<SequenceDefinition>> {
        let mut out = Vec::new();
        for sequence_id in self.store.pending_sequences(tenant, lead)? {
            match self.catalog.get(&sequence_id)? {
                Some(def) => out.push(def),
                None => tracing::warn!(
                    "⚠️ Pending steps reference unknown sequence '{sequence_id}'; left untouched"
                ),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::execution::{ActivationKey, ExecutionStatus};
    use crate::sequence::StepDefinition;
    use crate::store::MemoryExecutionStore;
    use chrono::{Duration, TimeZone};
    use leadpulse_core::{EventId, SequenceId, TenantScope};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn tenant() -> TenantId {
        TenantId::from("acme")
    }

    fn lead() -> LeadId {
        LeadId::from("lead-1")
    }

    fn setup() -> (CancellationManager, Arc<MemoryExecutionStore>) {
        let mut trial = SequenceDefinition::new(
            "trial",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        )
        .with_step(StepDefinition::new(0, 24.0, "a"));
        trial.cancellation.retain_stages = vec!["trial_extended".into()];
        let mut sticky = SequenceDefinition::new(
            "sticky",
            TenantScope::Global,
            Trigger::StageEnter { stage: "customer".into() },
        )
        .with_step(StepDefinition::new(0, 24.0, "b"));
        sticky.cancellation.on_stage_exit = false;
        sticky.cancellation.on_conversion = false;
        let webinar = SequenceDefinition::new(
            "webinar",
            TenantScope::Global,
            Trigger::TimeAnchored { anchor: "webinar_at".into() },
        )
        .with_step(StepDefinition::new(0, -1.0, "c"));

        let catalog = Arc::new(MemoryCatalog::with_sequences(vec![trial, sticky, webinar]).unwrap());
        let store = Arc::new(MemoryExecutionStore::new());
        let manager = CancellationManager::new(store.clone(), catalog, SideEffects::disabled());
        (manager, store)
    }

    fn schedule(store: &MemoryExecutionStore, key: ActivationKey) -> PendingExecution {
        let exec = PendingExecution::new(&key, 0, "email", "tpl", t0() + Duration::hours(24), t0());
        store.schedule_activation(&key, vec![exec], t0()).unwrap().created.remove(0)
    }

    fn by_event(sequence: &str) -> ActivationKey {
        ActivationKey::from_event(&tenant(), &lead(), &SequenceId::from(sequence), &EventId::from("evt-0"))
    }

    #[test]
    fn test_stage_exit_respects_policy() {
        let (manager, store) = setup();
        schedule(&store, by_event("trial"));
        schedule(&store, by_event("sticky"));

        let extended = LifecycleEvent::stage_changed("evt-1", "acme", "lead-1", Some("trial"), "trial_extended", t0());
        assert!(manager.apply(&extended, t0()).unwrap().is_empty());

        let churned = LifecycleEvent::stage_changed("evt-2", "acme", "lead-1", Some("trial"), "churned", t0());
        let cancelled = manager.apply(&churned, t0()).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].sequence_id.as_str(), "trial");
        assert_eq!(store.pending_sequences(&tenant(), &lead()).unwrap(), vec![SequenceId::from("sticky")]);
    }

    #[test]
    fn test_conversion_and_manual_stop() {
        let (manager, store) = setup();
        schedule(&store, by_event("trial"));
        schedule(&store, by_event("sticky"));

        let converted = LifecycleEvent::new(EventId::from("evt-1"), tenant(), lead(), LifecycleKind::Converted, t0());
        assert_eq!(manager.apply(&converted, t0()).unwrap().len(), 1);

        let stop = LifecycleEvent::new(
            EventId::from("evt-2"),
            tenant(),
            lead(),
            LifecycleKind::Stopped { sequence_id: None },
            t0(),
        );
        assert_eq!(manager.apply(&stop, t0()).unwrap().len(), 1);
        assert!(store.pending_sequences(&tenant(), &lead()).unwrap().is_empty());
    }

    #[test]
    fn test_executed_steps_are_untouched() {
        let (manager, store) = setup();
        let exec = schedule(&store, by_event("trial"));
        let later = t0() + Duration::hours(24);
        let crate::execution::ClaimOutcome::Claimed(claimed) =
            store.claim(&exec.id, later, Duration::minutes(5)).unwrap()
        else {
            panic!("claim failed");
        };
        store.complete(&exec.id, claimed.lease_token.as_deref().unwrap(), later).unwrap();

        let lost = LifecycleEvent::new(
            EventId::from("evt-1"),
            tenant(),
            lead(),
            LifecycleKind::Lost { reason: None },
            later,
        );
        assert!(manager.apply(&lost, later).unwrap().is_empty());
        assert_eq!(store.get(&exec.id).unwrap().unwrap().status, ExecutionStatus::Executed);
    }

    #[test]
    fn test_anchor_change_keeps_new_anchor_steps() {
        let (manager, store) = setup();
        let old_at = t0() + Duration::days(2);
        let new_at = t0() + Duration::days(5);
        let seq = SequenceId::from("webinar");
        schedule(&store, ActivationKey::from_anchor(&tenant(), &lead(), &seq, "webinar_at", old_at));

        let moved = LifecycleEvent::context_updated("evt-1", "acme", "lead-1", "webinar_at", Some(new_at), t0());
        let cancelled = manager.apply(&moved, t0()).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].created_from, anchor_cause("webinar_at", old_at));

        // Re-sending the same value cancels nothing scheduled from it.
        let new_key = ActivationKey::from_anchor(&tenant(), &lead(), &seq, "webinar_at", new_at);
        schedule(&store, new_key);
        assert!(manager.apply(&moved, t0()).unwrap().is_empty());
    }
}
