//! # LeadPulse
//!
//! Runs the automation engine against a SQLite store and offers operator
//! commands for sequences, lifecycle events and executions.
//!
//! Usage:
//!   leadpulse run                                  # Start the engine (Ctrl-C to stop)
//!   leadpulse run --once                           # One inbox drain + coordinator pass
//!   leadpulse sequences import sequences.toml      # Load definitions
//!   leadpulse event emit acme lead-1 stage-changed --to trial
//!   leadpulse executions stats

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leadpulse_automation::{
    AlertLog, AutomationDb, AutomationEngine, EngineDeps, EventInbox, ExecutionStatus, ExecutionStore,
    LoopSettings, PendingExecution, SequenceCatalog, SideEffectWorker, SideEffects, import_file,
    spawn_engine,
};
use leadpulse_core::config::expand_path;
use leadpulse_core::{EventId, LeadId, LeadPulseConfig, LifecycleEvent, LifecycleKind, SequenceId, TenantId};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "leadpulse",
    version,
    about = "📨 LeadPulse: lifecycle-triggered lead communication engine"
)]
struct Cli {
    /// Config file (default: ~/.leadpulse/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the store path from config
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the automation engine
    Run {
        /// Drain the inbox and run one coordinator pass, then exit
        #[arg(long)]
        once: bool,
    },
    /// Manage sequence definitions
    Sequences {
        #[command(subcommand)]
        action: SequenceAction,
    },
    /// Lifecycle events
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Inspect executions
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum SequenceAction {
    /// Import `[[sequence]]` definitions from a TOML file
    Import { path: PathBuf },
    /// List every stored definition
    List,
}

#[derive(Subcommand)]
enum EventAction {
    /// Enqueue a lifecycle event for a lead
    Emit {
        /// Tenant id
        tenant: String,
        /// Lead id
        lead: String,
        /// Upstream event id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// When the event happened, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
        #[command(subcommand)]
        kind: EventKind,
    },
    /// Events that could not be processed
    Failed {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum EventKind {
    StageChanged {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
    },
    ContextUpdated {
        #[arg(long)]
        anchor: String,
        /// New anchor value, RFC 3339. Omit to clear the anchor.
        #[arg(long)]
        value: Option<String>,
    },
    Converted,
    Lost {
        #[arg(long)]
        reason: Option<String>,
    },
    Stopped {
        /// Stop one sequence; all of the lead's sequences when omitted
        #[arg(long)]
        sequence: Option<String>,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// Executions of one lead
    List { tenant: String, lead: String },
    /// Executions that exhausted their attempts
    Failed {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Executions in a status (pending, executing, executed, cancelled, failed_terminal)
    Status {
        status: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Count per status
    Stats,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC 3339 timestamp '{value}'"))?
        .with_timezone(&Utc))
}

fn load_config(cli: &Cli) -> Result<LeadPulseConfig> {
    let config = match &cli.config {
        Some(path) => LeadPulseConfig::load_from(&expand_path(path))?,
        None => LeadPulseConfig::load()?,
    };
    Ok(config)
}

fn open_db(cli: &Cli, config: &LeadPulseConfig) -> Result<Arc<AutomationDb>> {
    let path = match &cli.db {
        Some(path) => expand_path(path),
        None => config.store.resolved_path(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = AutomationDb::open(&path).with_context(|| format!("open store {}", path.display()))?;
    Ok(Arc::new(db))
}

fn print_executions(executions: &[PendingExecution]) {
    if executions.is_empty() {
        println!("(none)");
        return;
    }
    for e in executions {
        println!(
            "{}  {:<15} {}/{} {}#{} via {} at {} (attempts: {}){}",
            e.id,
            e.status.as_str(),
            e.tenant_id,
            e.lead_id,
            e.sequence_id,
            e.step_order_index,
            e.channel,
            e.scheduled_fire_at.to_rfc3339(),
            e.attempt_count,
            e.last_error
                .as_deref()
                .map(|err| format!(" error: {err}"))
                .unwrap_or_default()
        );
    }
}

fn print_alerts(alerts: &AlertLog) {
    let raised = alerts.recent();
    if raised.is_empty() {
        return;
    }
    println!("🚨 {} execution(s) failed terminally:", raised.len());
    for a in raised {
        println!(
            "   {} {}/{} {}#{} via {} after {} attempt(s): {}",
            a.raised_at.to_rfc3339(),
            a.tenant_id,
            a.lead_id,
            a.sequence_id,
            a.step_order_index,
            a.channel,
            a.attempts,
            a.error
        );
    }
}

async fn run_engine(config: &LeadPulseConfig, db: Arc<AutomationDb>, once: bool) -> Result<()> {
    let router = leadpulse_channels::build_router(config)?;
    tracing::info!("📡 Channels: {:?} (default: {})", router.channels(), config.channels.default);

    let alerts = Arc::new(AlertLog::new(config.alerts.history_limit));
    let mut worker = SideEffectWorker::new(alerts.clone()).with_alert_webhook(config.alerts.webhook_url.clone());
    if let Some(score) = leadpulse_channels::build_score(config)? {
        worker = worker.with_score(
            score,
            config.score.max_attempts,
            leadpulse_channels::score_retry_delay(config),
        );
    }
    let (effects, rx) = SideEffects::channel();
    let effects_task = tokio::spawn(Arc::new(worker).run(rx));

    let deps = EngineDeps::sqlite(db.clone(), Arc::new(router));
    let engine = Arc::new(AutomationEngine::from_config(config, deps, effects));
    let settings = LoopSettings::from_config(config);

    if once {
        let now = Utc::now();
        let events = engine
            .drain_inbox(&*db, now, settings.event_batch_size, settings.stale_after)
            .await?;
        let report = engine.run_due(Utc::now()).await?;
        println!(
            "✅ {events} event(s) handled; executed {}, retried {}, failed {}, skipped {}, reclaimed {}",
            report.executed, report.retried, report.failed, report.skipped, report.reclaimed
        );
    } else {
        println!("📨 LeadPulse v{}", env!("CARGO_PKG_VERSION"));
        println!("   🆔 Worker:   {}", engine.worker_id());
        println!("   ⏱️  Poll:     {:?}", settings.poll_interval);
        println!();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let inbox: Arc<dyn EventInbox> = db.clone();
        let handle = spawn_engine(engine.clone(), inbox, settings, shutdown_rx);

        tokio::signal::ctrl_c().await?;
        tracing::info!("🛑 Shutdown requested");
        shutdown_tx.send(true).ok();
        handle.await?;
    }

    // Dropping the engine closes the side-effect channel.
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(10), effects_task).await.is_err() {
        tracing::warn!("⚠️ Side effects still running at shutdown");
    }
    print_alerts(&alerts);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Initialize logging
    let filter = if cli.verbose {
        "leadpulse=debug,leadpulse_automation=debug,leadpulse_channels=debug"
    } else {
        "leadpulse=info,leadpulse_automation=info,leadpulse_channels=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let db = open_db(&cli, &config)?;

    match cli.command {
        Command::Run { once } => run_engine(&config, db, once).await?,

        Command::Sequences { action } => match action {
            SequenceAction::Import { path } => {
                let count = import_file(&*db, &path)?;
                println!("✅ Imported {count} sequence(s)");
            }
            SequenceAction::List => {
                let sequences = db.list_all()?;
                if sequences.is_empty() {
                    println!("(none)");
                }
                for s in sequences {
                    println!(
                        "{} {:<24} {:<12} {:<14} {} step(s)",
                        if s.active { "🟢" } else { "⚪" },
                        s.id,
                        s.tenant_scope,
                        s.kind().as_str(),
                        s.steps.len()
                    );
                }
            }
        },

        Command::Event { action } => match action {
            EventAction::Emit {
                tenant,
                lead,
                id,
                at,
                kind,
            } => {
                let occurred_at = at.as_deref().map(parse_time).transpose()?.unwrap_or_else(Utc::now);
                let kind = match kind {
                    EventKind::StageChanged { from, to } => LifecycleKind::StageChanged { from, to },
                    EventKind::ContextUpdated { anchor, value } => LifecycleKind::ContextUpdated {
                        anchor,
                        value: value.as_deref().map(parse_time).transpose()?,
                    },
                    EventKind::Converted => LifecycleKind::Converted,
                    EventKind::Lost { reason } => LifecycleKind::Lost { reason },
                    EventKind::Stopped { sequence } => LifecycleKind::Stopped {
                        sequence_id: sequence.map(SequenceId::from),
                    },
                };
                let event = LifecycleEvent::new(
                    id.map(EventId::from).unwrap_or_else(EventId::generate),
                    TenantId::from(tenant),
                    LeadId::from(lead),
                    kind,
                    occurred_at,
                );
                let seq = db.enqueue(&event, Utc::now())?;
                println!("📥 Queued {} as #{seq} ({})", event.event_id, event.kind.label());
            }
            EventAction::Failed { limit } => {
                let failed = db.failed_events(limit)?;
                if failed.is_empty() {
                    println!("(none)");
                }
                for (seq, event_id, error) in failed {
                    println!("#{seq} {event_id}: {error}");
                }
            }
        },

        Command::Executions { action } => match action {
            ExecutionAction::List { tenant, lead } => {
                let executions = db.list_for_lead(&TenantId::from(tenant), &LeadId::from(lead))?;
                print_executions(&executions);
            }
            ExecutionAction::Failed { limit } => {
                print_executions(&db.list_by_status(ExecutionStatus::FailedTerminal, limit)?);
            }
            ExecutionAction::Status { status, limit } => {
                let status = ExecutionStatus::parse(&status)
                    .with_context(|| format!("unknown status '{status}'"))?;
                print_executions(&db.list_by_status(status, limit)?);
            }
            ExecutionAction::Stats => {
                let counts = db.status_counts()?;
                for status in ExecutionStatus::ALL {
                    println!("{:<16} {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
                }
            }
        },
    }

    Ok(())
}
