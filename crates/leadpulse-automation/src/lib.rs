//! # LeadPulse Automation
//!
//! Lifecycle-triggered communication engine: watches a lead's funnel stage
//! and anchor timestamps, schedules ordered message sequences, executes them
//! idempotently and cancels what no longer applies.
//!
//! ## Design Principles
//! - Every status change is a compare-and-set; several workers may share a store
//! - At most one live execution per (lead, sequence, step)
//! - SQLite persistence, with in-memory stores for embedding and tests
//! - Side effects (score, alerts) run off the dispatch path
//!
//! ## Architecture
//! ```text
//! LifecycleEvent (inbox)
//!   ├── CancellationManager → PENDING → CANCELLED
//!   ├── TriggerEvaluator (SequenceCatalog, anchors) → Activation
//!   └── StepScheduler → PendingExecution × N (one transaction)
//!
//! ExecutionCoordinator (tokio interval + Notify)
//!   ├── reclaim expired leases
//!   ├── claim PENDING → EXECUTING (lease)
//!   ├── ChannelDispatcher (bounded timeout)
//!   └── EXECUTED | PENDING (backoff) | FAILED_TERMINAL
//!                      └── SideEffectWorker → ScoreRecalculator, AlertLog
//! ```

pub mod cancellation;
pub mod catalog;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod execution;
pub mod inbox;
pub mod notify;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod sequence;
pub mod store;
pub mod trigger;

pub use cancellation::CancellationManager;
pub use catalog::{MemoryCatalog, SequenceCatalog, SequenceFile, import_file};
pub use context::{AnchorProjection, MemoryAnchors};
pub use coordinator::{CoordinatorSettings, ExecuteOutcome, ExecutionCoordinator, PassReport};
pub use engine::{AutomationEngine, EngineDeps, EventReport, LoopSettings, spawn_engine};
pub use execution::{
    ActivationKey, CancelFilter, ClaimOutcome, ExecutionStatus, FailureTransition, PendingExecution,
    ScheduleOutcome,
};
pub use inbox::{EventInbox, InboxEntry, MemoryInbox};
pub use notify::{Alert, AlertLog, AutomationEvent, SideEffectWorker, SideEffects};
pub use persistence::AutomationDb;
pub use retry::RetryPolicy;
pub use scheduler::StepScheduler;
pub use sequence::{CancellationPolicy, SequenceDefinition, StepDefinition, Trigger, TriggerKind};
pub use store::{ExecutionStore, MemoryExecutionStore};
pub use trigger::{Activation, TriggerEvaluator};
