//! # LeadPulse Core
//! Shared ids, lifecycle events, configuration, errors and the traits the
//! automation engine uses to talk to its collaborators (channels, scoring,
//! lead context, template rendering).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::LeadPulseConfig;
pub use error::{DispatchError, LeadPulseError, Result};
pub use traits::{ChannelDispatcher, LeadContextSource, MessageRenderer, ScoreRecalculator};
pub use types::{
    DispatchReceipt, DispatchRequest, EventId, ExecutionId, LeadId, LifecycleEvent, LifecycleKind,
    RenderedMessage, SequenceId, TenantId, TenantScope,
};
