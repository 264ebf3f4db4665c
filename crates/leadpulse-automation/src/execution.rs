//! Pending executions: the mutable runtime entity, one per scheduled step.

use std::fmt;

use chrono::{DateTime, Utc};
use leadpulse_core::{EventId, ExecutionId, LeadId, SequenceId, TenantId};
use serde::{Deserialize, Serialize};

/// `PENDING → EXECUTING → EXECUTED | CANCELLED | FAILED_TERMINAL`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Executed,
    Cancelled,
    FailedTerminal,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Executing,
        ExecutionStatus::Executed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Executing => "EXECUTING",
            ExecutionStatus::Executed => "EXECUTED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Executed | ExecutionStatus::Cancelled | ExecutionStatus::FailedTerminal
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key of one activation: `(lead, sequence, cause)`.
///
/// The cause is the upstream event id for stage-triggered sequences and the
/// anchor name + value for time-anchored ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationKey {
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub cause: String,
}

impl ActivationKey {
    pub fn from_event(
        tenant_id: &TenantId,
        lead_id: &LeadId,
        sequence_id: &SequenceId,
        event_id: &EventId,
    ) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            sequence_id: sequence_id.clone(),
            cause: format!("event:{event_id}"),
        }
    }

    pub fn from_anchor(
        tenant_id: &TenantId,
        lead_id: &LeadId,
        sequence_id: &SequenceId,
        anchor: &str,
        value: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            sequence_id: sequence_id.clone(),
            cause: anchor_cause(anchor, value),
        }
    }
}

pub fn anchor_cause(anchor: &str, value: DateTime<Utc>) -> String {
    format!("anchor:{anchor}@{}", value.timestamp_millis())
}

/// Storage-level uniqueness key: at most one non-terminal execution per slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub step_order_index: u32,
}

/// One sequence instance for one lead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExecution {
    pub id: ExecutionId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub step_order_index: u32,
    pub channel: String,
    pub template_ref: String,
    /// Derived once at creation; only a retry re-arm moves it.
    pub scheduled_fire_at: DateTime<Utc>,
    /// Fire time at creation. Never moves; step ordering is decided on it.
    pub original_fire_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    /// Activation cause this execution was created from.
    pub created_from: String,
    pub created_at: DateTime<Utc>,
    /// Failed dispatch attempts so far.
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PendingExecution {
    pub fn new(
        key: &ActivationKey,
        step_order_index: u32,
        channel: &str,
        template_ref: &str,
        scheduled_fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::generate(),
            tenant_id: key.tenant_id.clone(),
            lead_id: key.lead_id.clone(),
            sequence_id: key.sequence_id.clone(),
            step_order_index,
            channel: channel.to_string(),
            template_ref: template_ref.to_string(),
            scheduled_fire_at,
            original_fire_at: scheduled_fire_at,
            status: ExecutionStatus::Pending,
            created_from: key.cause.clone(),
            created_at: now,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            lease_token: None,
            lease_expires_at: None,
            finished_at: None,
        }
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey {
            tenant_id: self.tenant_id.clone(),
            lead_id: self.lead_id.clone(),
            sequence_id: self.sequence_id.clone(),
            step_order_index: self.step_order_index,
        }
    }

    pub fn instance(&self) -> InstanceKey {
        InstanceKey {
            tenant_id: self.tenant_id.clone(),
            lead_id: self.lead_id.clone(),
            sequence_id: self.sequence_id.clone(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending && self.scheduled_fire_at <= now
    }

    /// Same instance, earlier step, not finished, and originally due no later
    /// than `other`. A retried step keeps blocking the steps behind it.
    pub fn blocks(&self, other: &PendingExecution) -> bool {
        self.id != other.id
            && !self.status.is_terminal()
            && self.instance() == other.instance()
            && self.step_order_index < other.step_order_index
            && self.original_fire_at <= other.original_fire_at
    }
}

/// Time-bounded claim returned by a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The execution, now `EXECUTING` under the returned lease.
    Claimed(PendingExecution),
    /// Another worker or a cancellation won the race.
    NotPending,
    NotDue,
    /// An earlier step of the same instance has not finished yet.
    Blocked,
    Missing,
}

/// What to do with an `EXECUTING` execution whose dispatch failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureTransition {
    Retry { next_fire_at: DateTime<Utc> },
    Terminal,
}

/// Result of writing one activation to the store.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    /// The activation key was already recorded; nothing was written.
    pub duplicate: bool,
    pub created: Vec<PendingExecution>,
    /// Steps skipped because their slot already had a live execution.
    pub skipped_steps: Vec<u32>,
}

/// Which `PENDING` executions a cancellation targets.
#[derive(Debug, Clone)]
pub struct CancelFilter {
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    /// `None` cancels every sequence for the lead.
    pub sequence_id: Option<SequenceId>,
    /// Executions created from this cause survive.
    pub keep_cause: Option<String>,
}

impl CancelFilter {
    pub fn lead(tenant_id: &TenantId, lead_id: &LeadId) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            sequence_id: None,
            keep_cause: None,
        }
    }

    pub fn sequence(tenant_id: &TenantId, lead_id: &LeadId, sequence_id: &SequenceId) -> Self {
        Self {
            sequence_id: Some(sequence_id.clone()),
            ..Self::lead(tenant_id, lead_id)
        }
    }

    pub fn keeping(mut self, cause: Option<String>) -> Self {
        self.keep_cause = cause;
        self
    }

    pub fn matches(&self, exec: &PendingExecution) -> bool {
        exec.status == ExecutionStatus::Pending
            && exec.tenant_id == self.tenant_id
            && exec.lead_id == self.lead_id
            && self.sequence_id.as_ref().is_none_or(|s| *s == exec.sequence_id)
            && self.keep_cause.as_ref().is_none_or(|c| *c != exec.created_from)
    }
}
