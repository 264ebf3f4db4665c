//! Sequence definitions: the read-mostly model of what to send and when.

use std::collections::HashSet;

use chrono::Duration;
use leadpulse_core::{LeadPulseError, Result, SequenceId, TenantScope};
use serde::{Deserialize, Serialize};

/// Longest offset a step may carry (five years either side of the reference).
const MAX_DELAY_HOURS: f64 = 24.0 * 366.0 * 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    StageEnter,
    TimeAnchored,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::StageEnter => "STAGE_ENTER",
            TriggerKind::TimeAnchored => "TIME_ANCHORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STAGE_ENTER" => Some(TriggerKind::StageEnter),
            "TIME_ANCHORED" => Some(TriggerKind::TimeAnchored),
            _ => None,
        }
    }
}

/// When a sequence becomes active for a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Lead enters the named funnel stage; steps offset from the transition.
    StageEnter { stage: String },
    /// Steps offset from a named timestamp in the lead's context.
    TimeAnchored { anchor: String },
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::StageEnter { .. } => TriggerKind::StageEnter,
            Trigger::TimeAnchored { .. } => TriggerKind::TimeAnchored,
        }
    }
}

/// One message in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the sequence. Tie-break for equal fire times.
    pub order_index: u32,
    /// Signed offset from the activation's reference time.
    pub delay_hours: f64,
    pub template_ref: String,
    /// Channel name; falls back to the configured default.
    #[serde(default)]
    pub channel: Option<String>,
}

impl StepDefinition {
    pub fn new(order_index: u32, delay_hours: f64, template_ref: &str) -> Self {
        Self {
            order_index,
            delay_hours,
            template_ref: template_ref.to_string(),
            channel: None,
        }
    }

    pub fn via(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::milliseconds((self.delay_hours * 3_600_000.0).round() as i64)
    }
}

/// When pending steps of a sequence are cancelled for a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    /// STAGE_ENTER only: leaving the trigger stage cancels.
    #[serde(default = "bool_true")]
    pub on_stage_exit: bool,
    /// Stages that still count as "in" the trigger stage.
    #[serde(default)]
    pub retain_stages: Vec<String>,
    /// Entering any of these stages always cancels.
    #[serde(default)]
    pub cancel_stages: Vec<String>,
    #[serde(default = "bool_true")]
    pub on_conversion: bool,
    #[serde(default = "bool_true")]
    pub on_loss: bool,
    /// TIME_ANCHORED only: a moved or cleared anchor cancels steps
    /// scheduled from the previous value.
    #[serde(default = "bool_true")]
    pub on_anchor_change: bool,
}

fn bool_true() -> bool {
    true
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            on_stage_exit: true,
            retain_stages: Vec::new(),
            cancel_stages: Vec::new(),
            on_conversion: true,
            on_loss: true,
            on_anchor_change: true,
        }
    }
}

impl CancellationPolicy {
    /// Whether moving to `new_stage` takes the lead out of this sequence's context.
    pub fn cancels_on_stage(&self, trigger: &Trigger, new_stage: &str) -> bool {
        if self.cancel_stages.iter().any(|s| s == new_stage) {
            return true;
        }
        match trigger {
            Trigger::StageEnter { stage } => {
                self.on_stage_exit
                    && stage != new_stage
                    && !self.retain_stages.iter().any(|s| s == new_stage)
            }
            Trigger::TimeAnchored { .. } => false,
        }
    }
}

/// A trigger plus an ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: SequenceId,
    #[serde(default)]
    pub name: String,
    pub tenant_scope: TenantScope,
    pub trigger: Trigger,
    #[serde(default = "bool_true")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub cancellation: CancellationPolicy,
}

impl SequenceDefinition {
    pub fn new(id: &str, tenant_scope: TenantScope, trigger: Trigger) -> Self {
        Self {
            id: SequenceId::from(id),
            name: id.to_string(),
            tenant_scope,
            trigger,
            active: true,
            steps: Vec::new(),
            cancellation: CancellationPolicy::default(),
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn kind(&self) -> TriggerKind {
        self.trigger.kind()
    }

    /// Steps sorted by `order_index`.
    pub fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order_index);
        steps
    }

    /// Check the definition can be scheduled. Zero steps is valid.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(LeadPulseError::Catalog("sequence id must not be empty".into()));
        }
        match &self.trigger {
            Trigger::StageEnter { stage } if stage.trim().is_empty() => {
                return Err(LeadPulseError::configuration(&self.id, "trigger stage is empty"));
            }
            Trigger::TimeAnchored { anchor } if anchor.trim().is_empty() => {
                return Err(LeadPulseError::configuration(&self.id, "trigger anchor is empty"));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.order_index) {
                return Err(LeadPulseError::configuration(
                    &self.id,
                    format!("duplicate step order_index {}", step.order_index),
                ));
            }
            if step.template_ref.trim().is_empty() {
                return Err(LeadPulseError::configuration(
                    &self.id,
                    format!("step {} has no template_ref", step.order_index),
                ));
            }
            if !step.delay_hours.is_finite() || step.delay_hours.abs() > MAX_DELAY_HOURS {
                return Err(LeadPulseError::configuration(
                    &self.id,
                    format!("step {} has an out-of-range delay", step.order_index),
                ));
            }
            if step.delay_hours < 0.0 && self.kind() == TriggerKind::StageEnter {
                return Err(LeadPulseError::configuration(
                    &self.id,
                    format!(
                        "step {} has a negative delay on a STAGE_ENTER sequence",
                        step.order_index
                    ),
                ));
            }
            if matches!(&step.channel, Some(c) if c.trim().is_empty()) {
                return Err(LeadPulseError::configuration(
                    &self.id,
                    format!("step {} names an empty channel", step.order_index),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_sequence() -> SequenceDefinition {
        SequenceDefinition::new(
            "trial-nurture",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        )
        .with_step(StepDefinition::new(0, 0.0, "welcome"))
        .with_step(StepDefinition::new(1, 24.0, "tips"))
    }

    #[test]
    fn test_step_delay_handles_fractions_and_negatives() {
        assert_eq!(StepDefinition::new(0, 1.5, "t").delay(), Duration::minutes(90));
        assert_eq!(StepDefinition::new(0, -1.0, "t").delay(), Duration::hours(-1));
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(stage_sequence().validate().is_ok());
        let empty = SequenceDefinition::new(
            "empty",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        );
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_order_index() {
        let seq = stage_sequence().with_step(StepDefinition::new(1, 48.0, "again"));
        let err = seq.validate().unwrap_err();
        assert!(matches!(err, LeadPulseError::Configuration { .. }));
    }

    #[test]
    fn test_validate_negative_delay_only_for_anchored() {
        let stage = stage_sequence().with_step(StepDefinition::new(2, -1.0, "early"));
        assert!(stage.validate().is_err());

        let anchored = SequenceDefinition::new(
            "webinar-reminders",
            TenantScope::Global,
            Trigger::TimeAnchored { anchor: "webinar_at".into() },
        )
        .with_step(StepDefinition::new(0, -24.0, "day-before"))
        .with_step(StepDefinition::new(1, -1.0, "hour-before"));
        assert!(anchored.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nan_delay_and_blank_template() {
        let seq = stage_sequence().with_step(StepDefinition::new(5, f64::NAN, "x"));
        assert!(seq.validate().is_err());
        let seq = stage_sequence().with_step(StepDefinition::new(5, 1.0, " "));
        assert!(seq.validate().is_err());
    }

    #[test]
    fn test_ordered_steps_sorts_by_index_not_delay() {
        let seq = SequenceDefinition::new(
            "odd",
            TenantScope::Global,
            Trigger::StageEnter { stage: "trial".into() },
        )
        .with_step(StepDefinition::new(2, 1.0, "c"))
        .with_step(StepDefinition::new(0, 10.0, "a"))
        .with_step(StepDefinition::new(1, 5.0, "b"));
        let order: Vec<u32> = seq.ordered_steps().iter().map(|s| s.order_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_cancellation_policy_stage_rules() {
        let trigger = Trigger::StageEnter { stage: "trial".into() };
        let mut policy = CancellationPolicy::default();
        assert!(!policy.cancels_on_stage(&trigger, "trial"));
        assert!(policy.cancels_on_stage(&trigger, "paid"));

        policy.retain_stages = vec!["trial_extended".into()];
        assert!(!policy.cancels_on_stage(&trigger, "trial_extended"));

        policy.on_stage_exit = false;
        assert!(!policy.cancels_on_stage(&trigger, "paid"));
        policy.cancel_stages = vec!["paid".into()];
        assert!(policy.cancels_on_stage(&trigger, "paid"));

        let anchored = Trigger::TimeAnchored { anchor: "webinar_at".into() };
        assert!(!CancellationPolicy::default().cancels_on_stage(&anchored, "paid"));
    }

    #[test]
    fn test_trigger_serde_is_tagged() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"kind":"time_anchored","anchor":"webinar_at"}"#).unwrap();
        assert_eq!(trigger.kind(), TriggerKind::TimeAnchored);
        assert_eq!(TriggerKind::parse(trigger.kind().as_str()), Some(TriggerKind::TimeAnchored));
    }
}
