//! Step scheduling: activation → pending executions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadpulse_core::{LeadPulseError, Result};

use crate::execution::{PendingExecution, ScheduleOutcome};
use crate::store::ExecutionStore;
use crate::trigger::Activation;

pub struct StepScheduler {
    store: Arc<dyn ExecutionStore>,
    default_channel: String,
}

impl StepScheduler {
    pub fn new(store: Arc<dyn ExecutionStore>, default_channel: &str) -> Self {
        Self {
            store,
            default_channel: default_channel.to_string(),
        }
    }

    /// Expand one activation into executions and write them atomically.
    ///
    /// A misconfigured sequence fails here, before anything is stored.
    /// Fire times already in the past are kept; they are simply due now.
    pub fn schedule(&self, activation: &Activation, now: DateTime<Utc>) -> Result<ScheduleOutcome> {
        let sequence = &activation.sequence;
        sequence.validate()?;

        let mut executions = Vec::with_capacity(sequence.steps.len());
        for step in sequence.ordered_steps() {
            let fire_at = activation
                .reference_time
                .checked_add_signed(step.delay())
                .ok_or_else(|| {
                    LeadPulseError::configuration(
                        &sequence.id,
                        format!("step {} fire time is out of range", step.order_index),
                    )
                })?;
            let channel = step.channel.as_deref().unwrap_or(&self.default_channel);
            executions.push(PendingExecution::new(
                &activation.key,
                step.order_index,
                channel,
                &step.template_ref,
                fire_at,
                now,
            ));
        }

        let outcome = self.store.schedule_activation(&activation.key, executions, now)?;
        if outcome.duplicate {
            tracing::debug!(
                "Activation {} / {} ({}) already scheduled",
                activation.key.lead_id,
                sequence.id,
                activation.key.cause
            );
        } else {
            tracing::info!(
                "🗓️ Sequence '{}' activated for lead {}: {} step(s) scheduled, {} skipped",
                sequence.id,
                activation.key.lead_id,
                outcome.created.len(),
                outcome.skipped_steps.len()
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ActivationKey, ExecutionStatus};
    use crate::sequence::{SequenceDefinition, StepDefinition, Trigger};
    use crate::store::MemoryExecutionStore;
    use chrono::{Duration, TimeZone};
    use leadpulse_core::{EventId, LeadId, TenantId, TenantScope};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn activation(sequence: SequenceDefinition, reference_time: DateTime<Utc>) -> Activation {
        Activation {
            key: ActivationKey::from_event(
                &TenantId::from("acme"),
                &LeadId::from("lead-1"),
                &sequence.id,
                &EventId::from("evt-1"),
            ),
            sequence,
            reference_time,
        }
    }

    #[test]
    fn test_fire_times_follow_delays_not_order() {
        let store = Arc::new(MemoryExecutionStore::new());
        let scheduler = StepScheduler::new(store.clone(), "email");
        let sequence = SequenceDefinition::new(
            "nurture",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        )
        .with_step(StepDefinition::new(0, 0.0, "a"))
        .with_step(StepDefinition::new(1, 72.0, "b").via("whatsapp"))
        .with_step(StepDefinition::new(2, 24.0, "c"));

        let outcome = scheduler.schedule(&activation(sequence, t0()), t0()).unwrap();
        assert_eq!(outcome.created.len(), 3);
        let fire: Vec<_> = outcome.created.iter().map(|e| e.scheduled_fire_at).collect();
        assert_eq!(fire, vec![t0(), t0() + Duration::hours(72), t0() + Duration::hours(24)]);
        assert_eq!(outcome.created[0].channel, "email");
        assert_eq!(outcome.created[1].channel, "whatsapp");
        assert!(outcome.created.iter().all(|e| e.status == ExecutionStatus::Pending));
    }

    #[test]
    fn test_negative_offset_in_the_past_is_due_immediately() {
        let store = Arc::new(MemoryExecutionStore::new());
        let scheduler = StepScheduler::new(store.clone(), "email");
        let anchor = t0();
        let sequence = SequenceDefinition::new(
            "webinar",
            TenantScope::Global,
            Trigger::TimeAnchored { anchor: "webinar_at".into() },
        )
        .with_step(StepDefinition::new(0, -1.0, "webinar-soon"));

        let now = anchor - Duration::minutes(30);
        let outcome = scheduler.schedule(&activation(sequence, anchor), now).unwrap();
        assert_eq!(outcome.created[0].scheduled_fire_at, anchor - Duration::hours(1));
        assert_eq!(store.due(now, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_zero_steps_is_a_valid_noop() {
        let store = Arc::new(MemoryExecutionStore::new());
        let scheduler = StepScheduler::new(store.clone(), "email");
        let sequence = SequenceDefinition::new(
            "empty",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        );
        let act = activation(sequence, t0());
        let outcome = scheduler.schedule(&act, t0()).unwrap();
        assert!(outcome.created.is_empty());
        assert!(store.activation_exists(&act.key).unwrap());
    }

    #[test]
    fn test_misconfigured_sequence_creates_nothing() {
        let store = Arc::new(MemoryExecutionStore::new());
        let scheduler = StepScheduler::new(store.clone(), "email");
        let sequence = SequenceDefinition::new(
            "bad",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        )
        .with_step(StepDefinition::new(0, 0.0, "ok"))
        .with_step(StepDefinition::new(1, -5.0, "before-entering?"));

        let act = activation(sequence, t0());
        let err = scheduler.schedule(&act, t0()).unwrap_err();
        assert!(matches!(err, LeadPulseError::Configuration { .. }));
        assert!(!store.activation_exists(&act.key).unwrap());
        assert!(store.due(t0(), 10).unwrap().is_empty());
    }
}
