//! Core value types: ids, tenant scope, lifecycle events, dispatch payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Lead identifier, owned by the surrounding CRM.
    LeadId
);
string_id!(TenantId);
string_id!(SequenceId);
string_id!(
    /// Upstream lifecycle event id, used for activation dedup.
    EventId
);
string_id!(
    /// Pending execution id. Doubles as the dispatch idempotency token.
    ExecutionId
);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("exec-{}", uuid::Uuid::new_v4()))
    }
}

impl EventId {
    pub fn generate() -> Self {
        Self(format!("evt-{}", uuid::Uuid::new_v4()))
    }
}

/// Who owns a sequence definition: one tenant, or the whole platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TenantScope {
    Global,
    Tenant(TenantId),
}

impl TenantScope {
    /// Whether a definition with this scope may run for a lead of `tenant`.
    pub fn covers(&self, tenant: &TenantId) -> bool {
        match self {
            TenantScope::Global => true,
            TenantScope::Tenant(owner) => owner == tenant,
        }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantScope::Global => f.write_str("global"),
            TenantScope::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

impl FromStr for TenantScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "global" => Ok(TenantScope::Global),
            Some(("tenant", id)) if !id.is_empty() => Ok(TenantScope::Tenant(TenantId::from(id))),
            _ => Err(format!("invalid tenant scope '{s}' (expected 'global' or 'tenant:<id>')")),
        }
    }
}

impl From<TenantScope> for String {
    fn from(scope: TenantScope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for TenantScope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A change in a lead's funnel position or context, or the passage of time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: EventId,
    pub lead_id: LeadId,
    pub tenant_id: TenantId,
    pub kind: LifecycleKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleKind {
    StageChanged {
        #[serde(default)]
        from: Option<String>,
        to: String,
    },
    TimeTick {
        now: DateTime<Utc>,
    },
    /// `value = None` means the anchor was cleared.
    ContextUpdated {
        anchor: String,
        #[serde(default)]
        value: Option<DateTime<Utc>>,
    },
    Converted,
    Lost {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Manual stop of one sequence, or of every sequence when `None`.
    Stopped {
        #[serde(default)]
        sequence_id: Option<SequenceId>,
    },
}

impl LifecycleKind {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleKind::StageChanged { .. } => "stage_changed",
            LifecycleKind::TimeTick { .. } => "time_tick",
            LifecycleKind::ContextUpdated { .. } => "context_updated",
            LifecycleKind::Converted => "converted",
            LifecycleKind::Lost { .. } => "lost",
            LifecycleKind::Stopped { .. } => "stopped",
        }
    }
}

impl LifecycleEvent {
    pub fn new(
        event_id: EventId,
        tenant_id: TenantId,
        lead_id: LeadId,
        kind: LifecycleKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            lead_id,
            tenant_id,
            kind,
            occurred_at,
        }
    }

    pub fn stage_changed(
        event_id: &str,
        tenant_id: &str,
        lead_id: &str,
        from: Option<&str>,
        to: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventId::from(event_id),
            TenantId::from(tenant_id),
            LeadId::from(lead_id),
            LifecycleKind::StageChanged {
                from: from.map(str::to_string),
                to: to.to_string(),
            },
            at,
        )
    }

    pub fn context_updated(
        event_id: &str,
        tenant_id: &str,
        lead_id: &str,
        anchor: &str,
        value: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventId::from(event_id),
            TenantId::from(tenant_id),
            LeadId::from(lead_id),
            LifecycleKind::ContextUpdated {
                anchor: anchor.to_string(),
                value,
            },
            at,
        )
    }

    pub fn time_tick(tenant_id: &TenantId, lead_id: &LeadId, now: DateTime<Utc>) -> Self {
        Self::new(
            EventId::generate(),
            tenant_id.clone(),
            lead_id.clone(),
            LifecycleKind::TimeTick { now },
            now,
        )
    }
}

/// What the coordinator hands a channel dispatcher for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub step_order_index: u32,
    pub channel: String,
    pub template_ref: String,
    /// Stable across retries so channels that dedup can drop repeats.
    pub idempotency_token: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReceipt {
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

/// Message content produced by a template renderer for one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub recipient: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}
