//! SQLite-backed persistence for the automation engine.
//!
//! One database holds the sequence catalog, activations, executions, the
//! lead anchor projection and the lifecycle event inbox. Several worker
//! processes may share the file: every status transition is a conditional
//! `UPDATE`, and the live-slot uniqueness rule is a partial unique index.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::{
    EventId, ExecutionId, LeadContextSource, LeadId, LeadPulseError, LifecycleEvent, Result, SequenceId,
    TenantId, TenantScope,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::catalog::SequenceCatalog;
use crate::context::AnchorProjection;
use crate::execution::{
    ActivationKey, CancelFilter, ClaimOutcome, ExecutionStatus, FailureTransition, Lease,
    PendingExecution, ScheduleOutcome,
};
use crate::inbox::{EventInbox, InboxEntry};
use crate::sequence::{SequenceDefinition, TriggerKind};
use crate::store::ExecutionStore;

/// Shared SELECT column list for execution queries.
const EXECUTION_SELECT: &str = "SELECT id, tenant_id, lead_id, sequence_id, step_order_index, channel, template_ref, scheduled_fire_at, status, created_from, created_at, attempt_count, last_attempt_at, last_error, lease_token, lease_expires_at, finished_at, original_fire_at FROM executions";

const SEQUENCE_SELECT: &str =
    "SELECT id, name, tenant_scope, trigger_config, active, steps, cancellation FROM sequences";

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LeadPulseError {
    move |e| LeadPulseError::Store(format!("{context}: {e}"))
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<PendingExecution> {
    let status_str: String = row.get(8)?;
    let status = ExecutionStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown execution status '{status_str}'").into(),
        )
    })?;
    Ok(PendingExecution {
        id: ExecutionId::new(row.get::<_, String>(0)?),
        tenant_id: TenantId::new(row.get::<_, String>(1)?),
        lead_id: LeadId::new(row.get::<_, String>(2)?),
        sequence_id: SequenceId::new(row.get::<_, String>(3)?),
        step_order_index: row.get(4)?,
        channel: row.get(5)?,
        template_ref: row.get(6)?,
        scheduled_fire_at: from_ms(row.get(7)?),
        status,
        created_from: row.get(9)?,
        created_at: from_ms(row.get(10)?),
        attempt_count: row.get(11)?,
        last_attempt_at: row.get::<_, Option<i64>>(12)?.map(from_ms),
        last_error: row.get(13)?,
        lease_token: row.get(14)?,
        lease_expires_at: row.get::<_, Option<i64>>(15)?.map(from_ms),
        finished_at: row.get::<_, Option<i64>>(16)?.map(from_ms),
        original_fire_at: from_ms(row.get(17)?),
    })
}

/// Raw sequence row; JSON columns are decoded outside the rusqlite closure.
struct SequenceRow {
    id: String,
    name: String,
    tenant_scope: String,
    trigger_config: String,
    active: bool,
    steps: String,
    cancellation: String,
}

impl SequenceRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            tenant_scope: row.get(2)?,
            trigger_config: row.get(3)?,
            active: row.get::<_, i32>(4)? != 0,
            steps: row.get(5)?,
            cancellation: row.get(6)?,
        })
    }

    fn decode(self) -> Result<SequenceDefinition> {
        let id = SequenceId::new(self.id);
        let bad = |what: &str, e: &dyn std::fmt::Display| {
            LeadPulseError::configuration(&id, format!("invalid {what}: {e}"))
        };
        let tenant_scope: TenantScope = self
            .tenant_scope
            .parse()
            .map_err(|e: String| bad("tenant scope", &e))?;
        let trigger = serde_json::from_str(&self.trigger_config).map_err(|e| bad("trigger config", &e))?;
        let steps = serde_json::from_str(&self.steps).map_err(|e| bad("steps", &e))?;
        let cancellation =
            serde_json::from_str(&self.cancellation).map_err(|e| bad("cancellation policy", &e))?;
        Ok(SequenceDefinition {
            id,
            name: self.name,
            tenant_scope,
            trigger,
            active: self.active,
            steps,
            cancellation,
        })
    }
}

/// SQLite-backed persistence store for all automation data.
pub struct AutomationDb {
    conn: Mutex<Connection>,
}

impl AutomationDb {
    /// Open or create the automation database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        // WAL lets several worker processes share the file.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err("DB pragmas"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LeadPulseError::Store("automation db lock poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Sequence catalog (edited out-of-band)
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                tenant_scope TEXT NOT NULL,        -- 'global' or 'tenant:<id>'
                trigger_kind TEXT NOT NULL,        -- 'STAGE_ENTER', 'TIME_ANCHORED'
                trigger_config TEXT NOT NULL,      -- JSON: {kind, stage} or {kind, anchor}
                active INTEGER NOT NULL DEFAULT 1,
                steps TEXT NOT NULL DEFAULT '[]',  -- JSON array of steps
                cancellation TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_sequences_lookup
                ON sequences (tenant_scope, trigger_kind, active);

            -- One row per activation key; guards re-delivered events
            CREATE TABLE IF NOT EXISTS activations (
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                cause TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                execution_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, lead_id, sequence_id, cause)
            );

            -- Lifecycle events already applied; re-deliveries are skipped
            CREATE TABLE IF NOT EXISTS processed_events (
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                processed_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, lead_id, event_id)
            );

            -- Pending executions (terminal rows are kept for audit)
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                step_order_index INTEGER NOT NULL,
                channel TEXT NOT NULL,
                template_ref TEXT NOT NULL,
                scheduled_fire_at INTEGER NOT NULL,
                original_fire_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_from TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                lease_token TEXT,
                lease_expires_at INTEGER,
                finished_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS ux_executions_live_slot
                ON executions (tenant_id, lead_id, sequence_id, step_order_index)
                WHERE status IN ('PENDING', 'EXECUTING');
            CREATE INDEX IF NOT EXISTS ix_executions_due
                ON executions (status, scheduled_fire_at);
            CREATE INDEX IF NOT EXISTS ix_executions_lead
                ON executions (tenant_id, lead_id, status);

            -- Anchor projection fed by CONTEXT_UPDATED events
            CREATE TABLE IF NOT EXISTS lead_anchors (
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                anchor TEXT NOT NULL,
                value INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, lead_id, anchor)
            );

            -- Lifecycle event inbox
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,            -- full event JSON
                occurred_at INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER,
                processed_at INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS ix_lifecycle_events_open
                ON lifecycle_events (processed_at, seq);
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    fn query_executions(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PendingExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare execution query"))?;
        let rows = stmt
            .query_map(params, row_to_execution)
            .map_err(db_err("Query executions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read execution row"))
    }

    fn query_sequences(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SequenceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare sequence query"))?;
        let rows = stmt
            .query_map(params, SequenceRow::from_row)
            .map_err(db_err("Query sequences"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read sequence row"))
    }

    /// Recent inbox events that finished with an error, newest first.
    pub fn failed_events(&self, limit: usize) -> Result<Vec<(i64, String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, event_id, error FROM lifecycle_events
                 WHERE error IS NOT NULL ORDER BY seq DESC LIMIT ?1",
            )
            .map_err(db_err("Prepare failed events"))?;
        let rows = stmt
            .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err("Query failed events"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read failed event row"))
    }
}

// ─── Execution Store ──────────────────────────────────────

impl ExecutionStore for AutomationDb {
    fn activation_exists(&self, key: &ActivationKey) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM activations
                 WHERE tenant_id = ?1 AND lead_id = ?2 AND sequence_id = ?3 AND cause = ?4",
                params![
                    key.tenant_id.as_str(),
                    key.lead_id.as_str(),
                    key.sequence_id.as_str(),
                    key.cause
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Check activation"))?;
        Ok(found.is_some())
    }

    fn event_handled(&self, tenant_id: &TenantId, lead_id: &LeadId, event_id: &EventId) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_events
                 WHERE tenant_id = ?1 AND lead_id = ?2 AND event_id = ?3",
                params![tenant_id.as_str(), lead_id.as_str(), event_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Check processed event"))?;
        Ok(found.is_some())
    }

    fn mark_event_handled(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO processed_events (tenant_id, lead_id, event_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![tenant_id.as_str(), lead_id.as_str(), event_id.as_str(), ms(now)],
            )
            .map_err(db_err("Record processed event"))?;
        Ok(inserted == 1)
    }

    fn schedule_activation(
        &self,
        key: &ActivationKey,
        executions: Vec<PendingExecution>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin schedule tx"))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO activations (tenant_id, lead_id, sequence_id, cause, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.tenant_id.as_str(),
                    key.lead_id.as_str(),
                    key.sequence_id.as_str(),
                    key.cause,
                    ms(now)
                ],
            )
            .map_err(db_err("Record activation"))?;
        if inserted == 0 {
            return Ok(ScheduleOutcome {
                duplicate: true,
                ..Default::default()
            });
        }

        let mut outcome = ScheduleOutcome::default();
        for exec in executions {
            // A live row in the same slot trips the partial unique index.
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO executions
                     (id, tenant_id, lead_id, sequence_id, step_order_index, channel, template_ref,
                      scheduled_fire_at, original_fire_at, status, created_from, created_at, attempt_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        exec.id.as_str(),
                        exec.tenant_id.as_str(),
                        exec.lead_id.as_str(),
                        exec.sequence_id.as_str(),
                        exec.step_order_index,
                        exec.channel,
                        exec.template_ref,
                        ms(exec.scheduled_fire_at),
                        ms(exec.original_fire_at),
                        exec.status.as_str(),
                        exec.created_from,
                        ms(exec.created_at),
                        exec.attempt_count,
                    ],
                )
                .map_err(db_err("Insert execution"))?;
            if changed == 0 {
                outcome.skipped_steps.push(exec.step_order_index);
            } else {
                outcome.created.push(exec);
            }
        }

        tx.execute(
            "UPDATE activations SET execution_count = ?5
             WHERE tenant_id = ?1 AND lead_id = ?2 AND sequence_id = ?3 AND cause = ?4",
            params![
                key.tenant_id.as_str(),
                key.lead_id.as_str(),
                key.sequence_id.as_str(),
                key.cause,
                outcome.created.len() as i64
            ],
        )
        .map_err(db_err("Update activation count"))?;
        tx.commit().map_err(db_err("Commit schedule tx"))?;
        Ok(outcome)
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<PendingExecution>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{EXECUTION_SELECT} WHERE id = ?1"),
            [id.as_str()],
            row_to_execution,
        )
        .optional()
        .map_err(db_err("Get execution"))
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>> {
        self.query_executions(
            &format!(
                "{EXECUTION_SELECT} WHERE status = 'PENDING' AND scheduled_fire_at <= ?1
                 ORDER BY scheduled_fire_at, tenant_id, lead_id, sequence_id, step_order_index
                 LIMIT ?2"
            ),
            params![ms(now), limit as i64],
        )
    }

    fn claim(&self, id: &ExecutionId, now: DateTime<Utc>, lease_ttl: Duration) -> Result<ClaimOutcome> {
        let lease = Lease::new(now, lease_ttl);
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE executions
                 SET status = 'EXECUTING', lease_token = ?2, lease_expires_at = ?3, last_attempt_at = ?4
                 WHERE id = ?1
                   AND status = 'PENDING'
                   AND scheduled_fire_at <= ?4
                   AND NOT EXISTS (
                       SELECT 1 FROM executions AS prior
                       WHERE prior.tenant_id = executions.tenant_id
                         AND prior.lead_id = executions.lead_id
                         AND prior.sequence_id = executions.sequence_id
                         AND prior.step_order_index < executions.step_order_index
                         AND prior.status IN ('PENDING', 'EXECUTING')
                         AND prior.original_fire_at <= executions.original_fire_at
                   )",
                params![id.as_str(), lease.token, ms(lease.expires_at), ms(now)],
            )
            .map_err(db_err("Claim execution"))?;

        let row = conn
            .query_row(
                &format!("{EXECUTION_SELECT} WHERE id = ?1"),
                [id.as_str()],
                row_to_execution,
            )
            .optional()
            .map_err(db_err("Read claimed execution"))?;

        Ok(match row {
            None => ClaimOutcome::Missing,
            Some(row) if changed == 1 => ClaimOutcome::Claimed(row),
            Some(row) if row.status != ExecutionStatus::Pending => ClaimOutcome::NotPending,
            Some(row) if row.scheduled_fire_at > now => ClaimOutcome::NotDue,
            Some(_) => ClaimOutcome::Blocked,
        })
    }

    fn complete(&self, id: &ExecutionId, lease_token: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE executions
                 SET status = 'EXECUTED', lease_token = NULL, lease_expires_at = NULL, finished_at = ?3
                 WHERE id = ?1 AND status = 'EXECUTING' AND lease_token = ?2",
                params![id.as_str(), lease_token, ms(now)],
            )
            .map_err(db_err("Complete execution"))?;
        Ok(changed == 1)
    }

    fn record_failure(
        &self,
        id: &ExecutionId,
        lease_token: &str,
        transition: FailureTransition,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingExecution>> {
        let changed = {
            let conn = self.conn()?;
            match transition {
                FailureTransition::Retry { next_fire_at } => conn.execute(
                    "UPDATE executions
                     SET status = 'PENDING', scheduled_fire_at = ?4, attempt_count = attempt_count + 1,
                         last_error = ?3, lease_token = NULL, lease_expires_at = NULL
                     WHERE id = ?1 AND status = 'EXECUTING' AND lease_token = ?2",
                    params![id.as_str(), lease_token, error, ms(next_fire_at)],
                ),
                FailureTransition::Terminal => conn.execute(
                    "UPDATE executions
                     SET status = 'FAILED_TERMINAL', attempt_count = attempt_count + 1,
                         last_error = ?3, lease_token = NULL, lease_expires_at = NULL, finished_at = ?4
                     WHERE id = ?1 AND status = 'EXECUTING' AND lease_token = ?2",
                    params![id.as_str(), lease_token, error, ms(now)],
                ),
            }
            .map_err(db_err("Record dispatch failure"))?
        };
        if changed == 0 {
            return Ok(None);
        }
        ExecutionStore::get(self, id)
    }

    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>> {
        self.query_executions(
            &format!(
                "{EXECUTION_SELECT} WHERE status = 'EXECUTING' AND lease_expires_at < ?1
                 ORDER BY lease_expires_at LIMIT ?2"
            ),
            params![ms(now), limit as i64],
        )
    }

    fn cancel_pending(&self, filter: &CancelFilter, now: DateTime<Utc>) -> Result<Vec<PendingExecution>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin cancel tx"))?;

        let candidates: Vec<PendingExecution> = {
            let mut stmt = tx
                .prepare(&format!(
                    "{EXECUTION_SELECT} WHERE tenant_id = ?1 AND lead_id = ?2 AND status = 'PENDING'
                       AND (?3 IS NULL OR sequence_id = ?3)
                       AND (?4 IS NULL OR created_from != ?4)
                     ORDER BY sequence_id, step_order_index"
                ))
                .map_err(db_err("Prepare cancel scan"))?;
            let rows = stmt
                .query_map(
                    params![
                        filter.tenant_id.as_str(),
                        filter.lead_id.as_str(),
                        filter.sequence_id.as_ref().map(|s| s.as_str()),
                        filter.keep_cause.as_deref()
                    ],
                    row_to_execution,
                )
                .map_err(db_err("Scan cancel candidates"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Read cancel candidate"))?
        };

        let mut cancelled = Vec::with_capacity(candidates.len());
        for mut exec in candidates {
            let changed = tx
                .execute(
                    "UPDATE executions SET status = 'CANCELLED', finished_at = ?2
                     WHERE id = ?1 AND status = 'PENDING'",
                    params![exec.id.as_str(), ms(now)],
                )
                .map_err(db_err("Cancel execution"))?;
            if changed == 1 {
                exec.status = ExecutionStatus::Cancelled;
                exec.finished_at = Some(now);
                cancelled.push(exec);
            }
        }
        tx.commit().map_err(db_err("Commit cancel tx"))?;
        Ok(cancelled)
    }

    fn pending_sequences(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<SequenceId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT sequence_id FROM executions
                 WHERE tenant_id = ?1 AND lead_id = ?2 AND status = 'PENDING'
                 ORDER BY sequence_id",
            )
            .map_err(db_err("Prepare pending sequences"))?;
        let rows = stmt
            .query_map(params![tenant_id.as_str(), lead_id.as_str()], |row| {
                row.get::<_, String>(0).map(SequenceId::new)
            })
            .map_err(db_err("Query pending sequences"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read pending sequence"))
    }

    fn list_for_lead(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<PendingExecution>> {
        self.query_executions(
            &format!(
                "{EXECUTION_SELECT} WHERE tenant_id = ?1 AND lead_id = ?2
                 ORDER BY sequence_id, created_at, step_order_index"
            ),
            params![tenant_id.as_str(), lead_id.as_str()],
        )
    }

    fn list_by_status(&self, status: ExecutionStatus, limit: usize) -> Result<Vec<PendingExecution>> {
        self.query_executions(
            &format!(
                "{EXECUTION_SELECT} WHERE status = ?1
                 ORDER BY scheduled_fire_at, tenant_id, lead_id, sequence_id, step_order_index
                 LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
        )
    }

    fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, usize>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")
            .map_err(db_err("Prepare status counts"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err("Query status counts"))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.map_err(db_err("Read status count"))?;
            if let Some(status) = ExecutionStatus::parse(&status) {
                counts.insert(status, count as usize);
            }
        }
        Ok(counts)
    }
}

// ─── Sequence Catalog ──────────────────────────────────────

impl SequenceCatalog for AutomationDb {
    fn list_active_sequences(
        &self,
        scope: &TenantScope,
        kind: TriggerKind,
    ) -> Result<Vec<SequenceDefinition>> {
        let rows = self.query_sequences(
            &format!("{SEQUENCE_SELECT} WHERE active = 1 AND tenant_scope = ?1 AND trigger_kind = ?2 ORDER BY id"),
            params![scope.to_string(), kind.as_str()],
        )?;
        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(def) => definitions.push(def),
                // One corrupt row must not hide the other sequences.
                Err(e) => tracing::error!("❌ Skipping unreadable sequence: {e}"),
            }
        }
        Ok(definitions)
    }

    fn get(&self, id: &SequenceId) -> Result<Option<SequenceDefinition>> {
        let rows = self.query_sequences(&format!("{SEQUENCE_SELECT} WHERE id = ?1"), [id.as_str()])?;
        rows.into_iter().next().map(SequenceRow::decode).transpose()
    }

    fn list_all(&self) -> Result<Vec<SequenceDefinition>> {
        self.query_sequences(&format!("{SEQUENCE_SELECT} ORDER BY id"), [])?
            .into_iter()
            .map(SequenceRow::decode)
            .collect()
    }

    fn upsert(&self, definition: SequenceDefinition) -> Result<()> {
        definition.validate()?;
        let trigger = serde_json::to_string(&definition.trigger)?;
        let steps = serde_json::to_string(&definition.steps)?;
        let cancellation = serde_json::to_string(&definition.cancellation)?;
        self.conn()?
            .execute(
                "INSERT INTO sequences
                 (id, name, tenant_scope, trigger_kind, trigger_config, active, steps, cancellation, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   tenant_scope = excluded.tenant_scope,
                   trigger_kind = excluded.trigger_kind,
                   trigger_config = excluded.trigger_config,
                   active = excluded.active,
                   steps = excluded.steps,
                   cancellation = excluded.cancellation,
                   updated_at = excluded.updated_at",
                params![
                    definition.id.as_str(),
                    definition.name,
                    definition.tenant_scope.to_string(),
                    definition.kind().as_str(),
                    trigger,
                    definition.active as i32,
                    steps,
                    cancellation,
                    ms(Utc::now()),
                ],
            )
            .map_err(db_err("Upsert sequence"))?;
        tracing::info!("📚 Sequence saved: '{}' ({})", definition.id, definition.tenant_scope);
        Ok(())
    }
}

// ─── Anchor Projection ──────────────────────────────────────

impl LeadContextSource for AutomationDb {
    fn anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM lead_anchors WHERE tenant_id = ?1 AND lead_id = ?2 AND anchor = ?3",
                params![tenant_id.as_str(), lead_id.as_str(), anchor],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Read anchor"))?;
        Ok(value.map(from_ms))
    }
}

impl AnchorProjection for AutomationDb {
    fn record_anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
        value: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn()?;
        match value {
            Some(v) => conn.execute(
                "INSERT INTO lead_anchors (tenant_id, lead_id, anchor, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, lead_id, anchor) DO UPDATE SET
                   value = excluded.value, updated_at = excluded.updated_at",
                params![tenant_id.as_str(), lead_id.as_str(), anchor, ms(v), ms(Utc::now())],
            ),
            None => conn.execute(
                "DELETE FROM lead_anchors WHERE tenant_id = ?1 AND lead_id = ?2 AND anchor = ?3",
                params![tenant_id.as_str(), lead_id.as_str(), anchor],
            ),
        }
        .map_err(db_err("Record anchor"))?;
        Ok(())
    }

    fn anchored_leads(&self) -> Result<Vec<(TenantId, LeadId)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT tenant_id, lead_id FROM lead_anchors ORDER BY tenant_id, lead_id")
            .map_err(db_err("Prepare anchored leads"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    TenantId::new(row.get::<_, String>(0)?),
                    LeadId::new(row.get::<_, String>(1)?),
                ))
            })
            .map_err(db_err("Query anchored leads"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read anchored lead"))
    }
}

// ─── Lifecycle Event Inbox ──────────────────────────────────────

impl EventInbox for AutomationDb {
    fn enqueue(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> Result<i64> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lifecycle_events
             (event_id, tenant_id, lead_id, kind, payload, occurred_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id.as_str(),
                event.tenant_id.as_str(),
                event.lead_id.as_str(),
                event.kind.label(),
                payload,
                ms(event.occurred_at),
                ms(now)
            ],
        )
        .map_err(db_err("Enqueue lifecycle event"))?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_batch(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<InboxEntry>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin inbox claim tx"))?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT seq, payload FROM lifecycle_events
                     WHERE processed_at IS NULL AND (claimed_at IS NULL OR claimed_at < ?1)
                     ORDER BY seq LIMIT ?2",
                )
                .map_err(db_err("Prepare inbox scan"))?;
            let rows = stmt
                .query_map(params![ms(now - stale_after), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(db_err("Scan inbox"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Read inbox row"))?
        };

        let mut batch = Vec::with_capacity(rows.len());
        for (seq, payload) in rows {
            match serde_json::from_str::<LifecycleEvent>(&payload) {
                Ok(event) => {
                    tx.execute(
                        "UPDATE lifecycle_events SET claimed_by = ?2, claimed_at = ?3 WHERE seq = ?1",
                        params![seq, worker_id, ms(now)],
                    )
                    .map_err(db_err("Claim inbox event"))?;
                    batch.push(InboxEntry { seq, event });
                }
                Err(e) => {
                    tracing::error!("❌ Inbox event #{seq} has an unreadable payload: {e}");
                    tx.execute(
                        "UPDATE lifecycle_events SET processed_at = ?2, error = ?3 WHERE seq = ?1",
                        params![seq, ms(now), format!("unreadable payload: {e}")],
                    )
                    .map_err(db_err("Reject inbox event"))?;
                }
            }
        }
        tx.commit().map_err(db_err("Commit inbox claim tx"))?;
        Ok(batch)
    }

    fn mark_processed(&self, seq: i64, error: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE lifecycle_events SET processed_at = ?2, error = ?3 WHERE seq = ?1",
                params![seq, ms(now), error],
            )
            .map_err(db_err("Mark inbox event processed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{StepDefinition, Trigger};
    use chrono::TimeZone;
    use leadpulse_core::EventId;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn key(event: &str) -> ActivationKey {
        ActivationKey::from_event(
            &TenantId::from("acme"),
            &LeadId::from("lead-1"),
            &SequenceId::from("nurture"),
            &EventId::from(event),
        )
    }

    fn steps(key: &ActivationKey, delays: &[i64]) -> Vec<PendingExecution> {
        delays
            .iter()
            .enumerate()
            .map(|(i, h)| {
                PendingExecution::new(key, i as u32, "email", "tpl", t0() + Duration::hours(*h), t0())
            })
            .collect()
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("leadpulse-db-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("test.db");
        let db = AutomationDb::open(&path).unwrap();
        assert!(db.list_all().unwrap().is_empty());
        drop(db);
        // Re-opening runs migrations again without error.
        assert!(AutomationDb::open(&path).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_schedule_dedup_and_live_slot_index() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = key("evt-1");
        let out = db.schedule_activation(&a, steps(&a, &[0, 24, 72]), t0()).unwrap();
        assert_eq!(out.created.len(), 3);
        assert!(db.activation_exists(&a).unwrap());

        let dup = db.schedule_activation(&a, steps(&a, &[0, 24, 72]), t0()).unwrap();
        assert!(dup.duplicate);

        let b = key("evt-2");
        let racing = db.schedule_activation(&b, steps(&b, &[0, 24, 72]), t0()).unwrap();
        assert!(!racing.duplicate);
        assert_eq!(racing.skipped_steps, vec![0, 1, 2]);
        assert_eq!(db.status_counts().unwrap()[&ExecutionStatus::Pending], 3);
    }

    #[test]
    fn test_claim_complete_and_ordering() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = key("evt-1");
        let created = db.schedule_activation(&a, steps(&a, &[0, 0, 24]), t0()).unwrap().created;
        let ttl = Duration::minutes(5);

        assert_eq!(db.claim(&created[2].id, t0(), ttl).unwrap(), ClaimOutcome::NotDue);
        assert_eq!(db.claim(&created[1].id, t0(), ttl).unwrap(), ClaimOutcome::Blocked);

        let ClaimOutcome::Claimed(step0) = db.claim(&created[0].id, t0(), ttl).unwrap() else {
            panic!("step 0 should be claimable");
        };
        assert_eq!(step0.status, ExecutionStatus::Executing);
        assert_eq!(db.claim(&created[0].id, t0(), ttl).unwrap(), ClaimOutcome::NotPending);

        assert!(!db.complete(&step0.id, "stale-token", t0()).unwrap());
        assert!(db.complete(&step0.id, step0.lease_token.as_deref().unwrap(), t0()).unwrap());
        assert!(matches!(db.claim(&created[1].id, t0(), ttl).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn test_failure_transitions_and_expired_leases() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = key("evt-1");
        let id = db.schedule_activation(&a, steps(&a, &[0]), t0()).unwrap().created[0].id.clone();

        let ClaimOutcome::Claimed(claimed) = db.claim(&id, t0(), Duration::minutes(5)).unwrap() else {
            panic!("claim failed");
        };
        assert_eq!(db.expired_leases(t0() + Duration::minutes(10), 10).unwrap().len(), 1);

        let next = t0() + Duration::hours(1);
        let row = db
            .record_failure(
                &id,
                claimed.lease_token.as_deref().unwrap(),
                FailureTransition::Retry { next_fire_at: next },
                "smtp 451",
                t0(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.scheduled_fire_at, next);
        assert_eq!(row.last_error.as_deref(), Some("smtp 451"));
        assert!(db.due(t0(), 10).unwrap().is_empty());
        assert_eq!(db.due(next, 10).unwrap().len(), 1);

        // A stale token cannot record a failure.
        assert!(db
            .record_failure(&id, "stale", FailureTransition::Terminal, "x", next)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_retried_step_keeps_blocking_next_step() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = key("evt-1");
        let created = db.schedule_activation(&a, steps(&a, &[0, 0]), t0()).unwrap().created;
        let ttl = Duration::minutes(5);

        let ClaimOutcome::Claimed(step0) = db.claim(&created[0].id, t0(), ttl).unwrap() else {
            panic!("step 0 should be claimable");
        };
        let retry_at = t0() + Duration::hours(1);
        let token = step0.lease_token.as_deref().unwrap();
        db.record_failure(&step0.id, token, FailureTransition::Retry { next_fire_at: retry_at }, "smtp 451", t0())
            .unwrap()
            .unwrap();

        let later = retry_at + Duration::minutes(1);
        assert_eq!(db.claim(&created[1].id, later, ttl).unwrap(), ClaimOutcome::Blocked);
        let reloaded = ExecutionStore::get(&db, &created[0].id).unwrap().unwrap();
        assert_eq!(reloaded.original_fire_at, t0());
        assert_eq!(reloaded.scheduled_fire_at, retry_at);
    }

    #[test]
    fn test_processed_events_are_remembered_per_lead() {
        let db = AutomationDb::open_in_memory().unwrap();
        let (acme, lead) = (TenantId::from("acme"), LeadId::from("lead-1"));
        let evt = EventId::from("evt-1");

        assert!(!db.event_handled(&acme, &lead, &evt).unwrap());
        assert!(db.mark_event_handled(&acme, &lead, &evt, t0()).unwrap());
        assert!(db.event_handled(&acme, &lead, &evt).unwrap());
        assert!(!db.mark_event_handled(&acme, &lead, &evt, t0()).unwrap());
        assert!(!db.event_handled(&acme, &LeadId::from("lead-2"), &evt).unwrap());
    }

    #[test]
    fn test_cancel_pending_with_keep_cause() {
        let db = AutomationDb::open_in_memory().unwrap();
        let old = ActivationKey::from_anchor(
            &TenantId::from("acme"),
            &LeadId::from("lead-1"),
            &SequenceId::from("webinar"),
            "webinar_at",
            t0(),
        );
        db.schedule_activation(&old, steps(&old, &[-24, -1]), t0()).unwrap();

        let filter = CancelFilter::sequence(&old.tenant_id, &old.lead_id, &old.sequence_id)
            .keeping(Some(old.cause.clone()));
        assert!(db.cancel_pending(&filter, t0()).unwrap().is_empty());

        let filter = CancelFilter::sequence(&old.tenant_id, &old.lead_id, &old.sequence_id);
        let cancelled = db.cancel_pending(&filter, t0()).unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|e| e.status == ExecutionStatus::Cancelled));
        assert!(db.pending_sequences(&old.tenant_id, &old.lead_id).unwrap().is_empty());
    }

    #[test]
    fn test_catalog_round_trip() {
        let db = AutomationDb::open_in_memory().unwrap();
        let def = SequenceDefinition::new(
            "webinar",
            TenantScope::Tenant(TenantId::from("acme")),
            Trigger::TimeAnchored { anchor: "webinar_at".into() },
        )
        .with_step(StepDefinition::new(0, -24.0, "day-before"))
        .with_step(StepDefinition::new(1, -1.0, "hour-before").via("whatsapp"));
        db.upsert(def.clone()).unwrap();

        assert_eq!(SequenceCatalog::get(&db, &def.id).unwrap(), Some(def.clone()));
        let listed = db
            .list_active_sequences(&def.tenant_scope, TriggerKind::TimeAnchored)
            .unwrap();
        assert_eq!(listed, vec![def.clone()]);
        assert!(db
            .list_active_sequences(&TenantScope::Global, TriggerKind::TimeAnchored)
            .unwrap()
            .is_empty());

        let mut inactive = def;
        inactive.active = false;
        db.upsert(inactive.clone()).unwrap();
        assert!(db
            .list_active_sequences(&inactive.tenant_scope, TriggerKind::TimeAnchored)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_anchor_projection() {
        let db = AutomationDb::open_in_memory().unwrap();
        let tenant = TenantId::from("acme");
        let lead = LeadId::from("lead-1");
        db.record_anchor(&tenant, &lead, "webinar_at", Some(t0())).unwrap();
        assert_eq!(db.anchor(&tenant, &lead, "webinar_at").unwrap(), Some(t0()));
        assert_eq!(db.anchored_leads().unwrap().len(), 1);
        db.record_anchor(&tenant, &lead, "webinar_at", None).unwrap();
        assert!(db.anchored_leads().unwrap().is_empty());
    }

    #[test]
    fn test_inbox_claims_in_order_and_marks_processed() {
        let db = AutomationDb::open_in_memory().unwrap();
        for i in 0..3 {
            let event =
                LifecycleEvent::stage_changed(&format!("evt-{i}"), "acme", "lead-1", None, "trial", t0());
            db.enqueue(&event, t0()).unwrap();
        }
        let batch = db.claim_batch("w1", t0(), 2, Duration::minutes(5)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event.event_id.as_str(), "evt-0");
        db.mark_processed(batch[0].seq, None, t0()).unwrap();
        db.mark_processed(batch[1].seq, Some("boom"), t0()).unwrap();

        let rest = db.claim_batch("w2", t0(), 10, Duration::minutes(5)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.event_id.as_str(), "evt-2");
        assert_eq!(db.failed_events(10).unwrap().len(), 1);
    }
}
