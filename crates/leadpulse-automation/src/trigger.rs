//! Trigger evaluation: lifecycle event → activations.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadpulse_core::{
    LeadContextSource, LifecycleEvent, LifecycleKind, Result, TenantId, TenantScope,
};

use crate::catalog::SequenceCatalog;
use crate::execution::ActivationKey;
use crate::sequence::{SequenceDefinition, Trigger, TriggerKind};
use crate::store::ExecutionStore;

/// One sequence becoming applicable to one lead.
#[derive(Debug, Clone)]
pub struct Activation {
    pub key: ActivationKey,
    pub sequence: SequenceDefinition,
    /// Zero point for every step's delay.
    pub reference_time: DateTime<Utc>,
}

pub struct TriggerEvaluator {
    catalog: Arc<dyn SequenceCatalog>,
    context: Arc<dyn LeadContextSource>,
    store: Arc<dyn ExecutionStore>,
}

impl TriggerEvaluator {
    pub fn new(
        catalog: Arc<dyn SequenceCatalog>,
        context: Arc<dyn LeadContextSource>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            catalog,
            context,
            store,
        }
    }

    /// Active definitions of `kind` visible to `tenant`: its own plus global ones.
    fn candidates(&self, tenant: &TenantId, kind: TriggerKind) -> Result<Vec<SequenceDefinition>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let scopes = [TenantScope::Tenant(tenant.clone()), TenantScope::Global];
        for scope in &scopes {
            for def in self.catalog.list_active_sequences(scope, kind)? {
                if seen.insert(def.id.clone()) {
                    out.push(def);
                }
            }
        }
        Ok(out)
    }

    /// Activations this event produces that have not happened before.
    pub fn evaluate(&self, event: &LifecycleEvent) -> Result<Vec<Activation>> {
        let tenant = &event.tenant_id;
        let lead = &event.lead_id;

        let activations: Vec<Activation> = match &event.kind {
            LifecycleKind::StageChanged { to, .. } => self
                .candidates(tenant, TriggerKind::StageEnter)?
                .into_iter()
                .filter(|def| matches!(&def.trigger, Trigger::StageEnter { stage } if stage == to))
                .map(|def| Activation {
                    key: ActivationKey::from_event(tenant, lead, &def.id, &event.event_id),
                    sequence: def,
                    reference_time: event.occurred_at,
                })
                .collect(),

            LifecycleKind::ContextUpdated {
                anchor,
                value: Some(value),
            } => self
                .candidates(tenant, TriggerKind::TimeAnchored)?
                .into_iter()
                .filter(|def| matches!(&def.trigger, Trigger::TimeAnchored { anchor: a } if a == anchor))
                .map(|def| Activation {
                    key: ActivationKey::from_anchor(tenant, lead, &def.id, anchor, *value),
                    sequence: def,
                    reference_time: *value,
                })
                .collect(),

            LifecycleKind::TimeTick { .. } => {
                let mut out = Vec::new();
                for def in self.candidates(tenant, TriggerKind::TimeAnchored)? {
                    let Trigger::TimeAnchored { anchor } = &def.trigger else {
                        continue;
                    };
                    if let Some(value) = self.context.anchor(tenant, lead, anchor)? {
                        out.push(Activation {
                            key: ActivationKey::from_anchor(tenant, lead, &def.id, anchor, value),
                            sequence: def,
                            reference_time: value,
                        });
                    }
                }
                out
            }

            LifecycleKind::ContextUpdated { value: None, .. }
            | LifecycleKind::Converted
            | LifecycleKind::Lost { .. }
            | LifecycleKind::Stopped { .. } => Vec::new(),
        };

        let mut fresh = Vec::with_capacity(activations.len());
        for activation in activations {
            if self.store.activation_exists(&activation.key)? {
                tracing::debug!(
                    "Activation already recorded: {} / {} ({})",
                    activation.key.lead_id,
                    activation.key.sequence_id,
                    activation.key.cause
                );
                continue;
            }
            fresh.push(activation);
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::context::{AnchorProjection, MemoryAnchors};
    use crate::sequence::StepDefinition;
    use crate::store::MemoryExecutionStore;
    use chrono::TimeZone;
    use leadpulse_core::LeadId;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (TriggerEvaluator, Arc<MemoryAnchors>, Arc<MemoryExecutionStore>) {
        let catalog = MemoryCatalog::with_sequences(vec![
            SequenceDefinition::new(
                "trial-global",
                TenantScope::Global,
                Trigger::StageEnter { stage: "trial".into() },
            )
            .with_step(StepDefinition::new(0, 0.0, "welcome")),
            SequenceDefinition::new(
                "trial-acme",
                TenantScope::Tenant(TenantId::from("acme")),
                Trigger::StageEnter { stage: "trial".into() },
            )
            .with_step(StepDefinition::new(0, 0.0, "acme-welcome")),
            SequenceDefinition::new(
                "trial-other",
                TenantScope::Tenant(TenantId::from("other")),
                Trigger::StageEnter { stage: "trial".into() },
            ),
            SequenceDefinition::new(
                "webinar",
                TenantScope::Global,
                Trigger::TimeAnchored { anchor: "webinar_at".into() },
            )
            .with_step(StepDefinition::new(0, -1.0, "webinar-soon")),
        ])
        .unwrap();
        let anchors = Arc::new(MemoryAnchors::new());
        let store = Arc::new(MemoryExecutionStore::new());
        let evaluator = TriggerEvaluator::new(Arc::new(catalog), anchors.clone(), store.clone());
        (evaluator, anchors, store)
    }

    #[test]
    fn test_stage_change_matches_tenant_and_global() {
        let (evaluator, _, _) = setup();
        let event = LifecycleEvent::stage_changed("evt-1", "acme", "lead-1", Some("new"), "trial", t0());
        let mut ids: Vec<String> = evaluator
            .evaluate(&event)
            .unwrap()
            .iter()
            .map(|a| a.sequence.id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["trial-acme", "trial-global"]);

        let other_stage = LifecycleEvent::stage_changed("evt-2", "acme", "lead-1", None, "won", t0());
        assert!(evaluator.evaluate(&other_stage).unwrap().is_empty());
    }

    #[test]
    fn test_recorded_activation_is_noop() {
        let (evaluator, _, store) = setup();
        let event = LifecycleEvent::stage_changed("evt-1", "acme", "lead-1", None, "trial", t0());
        for activation in evaluator.evaluate(&event).unwrap() {
            store
                .schedule_activation(&activation.key, Vec::new(), t0())
                .unwrap();
        }
        assert!(evaluator.evaluate(&event).unwrap().is_empty());
    }

    #[test]
    fn test_anchor_reference_time_is_anchor_value() {
        let (evaluator, anchors, _) = setup();
        let webinar = t0() + chrono::Duration::days(3);
        let event = LifecycleEvent::context_updated("evt-1", "acme", "lead-1", "webinar_at", Some(webinar), t0());
        let activations = evaluator.evaluate(&event).unwrap();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].reference_time, webinar);

        // A tick sees nothing until the projection knows the anchor.
        let tick = LifecycleEvent::time_tick(&TenantId::from("acme"), &LeadId::from("lead-2"), t0());
        assert!(evaluator.evaluate(&tick).unwrap().is_empty());
        anchors
            .record_anchor(&TenantId::from("acme"), &LeadId::from("lead-2"), "webinar_at", Some(webinar))
            .unwrap();
        let activations = evaluator.evaluate(&tick).unwrap();
        assert_eq!(activations.len(), 1);
        assert!(activations[0].key.cause.starts_with("anchor:webinar_at@"));
    }

    #[test]
    fn test_cleared_anchor_and_terminal_kinds_activate_nothing() {
        let (evaluator, _, _) = setup();
        let cleared = LifecycleEvent::context_updated("evt-1", "acme", "lead-1", "webinar_at", None, t0());
        assert!(evaluator.evaluate(&cleared).unwrap().is_empty());
        let converted = LifecycleEvent::new(
            "evt-2".into(),
            TenantId::from("acme"),
            LeadId::from("lead-1"),
            LifecycleKind::Converted,
            t0(),
        );
        assert!(evaluator.evaluate(&converted).unwrap().is_empty());
    }
}
