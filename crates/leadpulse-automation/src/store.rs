//! Execution store: the single shared mutable resource of the engine.
//!
//! Every status change is a conditional update (compare-and-set on status
//! and, for leased rows, the lease token). Callers never read-then-write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::{EventId, ExecutionId, LeadId, LeadPulseError, Result, SequenceId, TenantId};

use crate::execution::{
    ActivationKey, CancelFilter, ClaimOutcome, ExecutionStatus, FailureTransition, InstanceKey,
    Lease, PendingExecution, ScheduleOutcome, SlotKey,
};

pub trait ExecutionStore: Send + Sync {
    fn activation_exists(&self, key: &ActivationKey) -> Result<bool>;

    /// Whether a lifecycle event was already applied for the lead.
    fn event_handled(&self, tenant_id: &TenantId, lead_id: &LeadId, event_id: &EventId) -> Result<bool>;

    /// Remember an applied lifecycle event. Returns `false` if it was already known.
    fn mark_event_handled(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record the activation and insert its executions atomically.
    ///
    /// Duplicate keys write nothing. Executions whose slot already holds a
    /// non-terminal execution are skipped.
    fn schedule_activation(
        &self,
        key: &ActivationKey,
        executions: Vec<PendingExecution>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome>;

    fn get(&self, id: &ExecutionId) -> Result<Option<PendingExecution>>;

    /// `PENDING` executions with `scheduled_fire_at <= now`, oldest first,
    /// ties broken by lead, sequence and step order.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>>;

    /// `PENDING → EXECUTING` under a fresh lease.
    fn claim(&self, id: &ExecutionId, now: DateTime<Utc>, lease_ttl: Duration) -> Result<ClaimOutcome>;

    /// `EXECUTING → EXECUTED` if `lease_token` still owns the row.
    fn complete(&self, id: &ExecutionId, lease_token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `EXECUTING → PENDING | FAILED_TERMINAL` if `lease_token` still owns the
    /// row. Increments `attempt_count`. Returns the updated row.
    fn record_failure(
        &self,
        id: &ExecutionId,
        lease_token: &str,
        transition: FailureTransition,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingExecution>>;

    /// `EXECUTING` executions whose lease expired before `now`.
    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>>;

    /// `PENDING → CANCELLED` for every match. Returns what was cancelled.
    fn cancel_pending(&self, filter: &CancelFilter, now: DateTime<Utc>) -> Result<Vec<PendingExecution>>;

    /// Sequences with at least one `PENDING` execution for the lead.
    fn pending_sequences(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<SequenceId>>;

    fn list_for_lead(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<PendingExecution>>;

    fn list_by_status(&self, status: ExecutionStatus, limit: usize) -> Result<Vec<PendingExecution>>;

    fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, usize>>;
}

/// Arena-backed in-memory store.
///
/// Rows live in a `Vec` and are addressed by index; `live_slots` maps each
/// [`SlotKey`] to its one non-terminal row, which is where the uniqueness
/// invariant is enforced.
#[derive(Default)]
pub struct MemoryExecutionStore {
    inner: Mutex<Arena>,
}

#[derive(Default)]
struct Arena {
    rows: Vec<PendingExecution>,
    by_id: HashMap<ExecutionId, usize>,
    live_slots: HashMap<SlotKey, usize>,
    by_instance: HashMap<InstanceKey, Vec<usize>>,
    activations: HashSet<ActivationKey>,
    handled_events: HashSet<(TenantId, LeadId, EventId)>,
}

impl Arena {
    fn index_of(&self, id: &ExecutionId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    fn insert(&mut self, exec: PendingExecution) -> usize {
        let idx = self.rows.len();
        self.by_id.insert(exec.id.clone(), idx);
        self.live_slots.insert(exec.slot(), idx);
        self.by_instance.entry(exec.instance()).or_default().push(idx);
        self.rows.push(exec);
        idx
    }

    fn finish(&mut self, idx: usize, status: ExecutionStatus, now: DateTime<Utc>) {
        let row = &mut self.rows[idx];
        row.status = status;
        row.lease_token = None;
        row.lease_expires_at = None;
        row.finished_at = Some(now);
        let slot = row.slot();
        if self.live_slots.get(&slot) == Some(&idx) {
            self.live_slots.remove(&slot);
        }
    }

    fn is_blocked(&self, idx: usize) -> bool {
        let target = &self.rows[idx];
        self.by_instance
            .get(&target.instance())
            .into_iter()
            .flatten()
            .any(|&other| self.rows[other].blocks(target))
    }
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Arena>> {
        self.inner
            .lock()
            .map_err(|_| LeadPulseError::Store("execution store lock poisoned".into()))
    }
}

fn due_order(a: &PendingExecution, b: &PendingExecution) -> std::cmp::Ordering {
    a.scheduled_fire_at
        .cmp(&b.scheduled_fire_at)
        .then_with(|| a.tenant_id.cmp(&b.tenant_id))
        .then_with(|| a.lead_id.cmp(&b.lead_id))
        .then_with(|| a.sequence_id.cmp(&b.sequence_id))
        .then_with(|| a.step_order_index.cmp(&b.step_order_index))
}

impl ExecutionStore for MemoryExecutionStore {
    fn activation_exists(&self, key: &ActivationKey) -> Result<bool> {
        Ok(self.lock()?.activations.contains(key))
    }

    fn event_handled(&self, tenant_id: &TenantId, lead_id: &LeadId, event_id: &EventId) -> Result<bool> {
        let key = (tenant_id.clone(), lead_id.clone(), event_id.clone());
        Ok(self.lock()?.handled_events.contains(&key))
    }

    fn mark_event_handled(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        event_id: &EventId,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = (tenant_id.clone(), lead_id.clone(), event_id.clone());
        Ok(self.lock()?.handled_events.insert(key))
    }

    fn schedule_activation(
        &self,
        key: &ActivationKey,
        executions: Vec<PendingExecution>,
        _now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let mut arena = self.lock()?;
        if !arena.activations.insert(key.clone()) {
            return Ok(ScheduleOutcome {
                duplicate: true,
                ..Default::default()
            });
        }
        let mut outcome = ScheduleOutcome::default();
        for exec in executions {
            if arena.live_slots.contains_key(&exec.slot()) {
                outcome.skipped_steps.push(exec.step_order_index);
                continue;
            }
            arena.insert(exec.clone());
            outcome.created.push(exec);
        }
        Ok(outcome)
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<PendingExecution>> {
        let arena = self.lock()?;
        Ok(arena.index_of(id).map(|idx| arena.rows[idx].clone()))
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>> {
        let arena = self.lock()?;
        let mut due: Vec<PendingExecution> =
            arena.rows.iter().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by(due_order);
        due.truncate(limit);
        Ok(due)
    }

    fn claim(&self, id: &ExecutionId, now: DateTime<Utc>, lease_ttl: Duration) -> Result<ClaimOutcome> {
        let mut arena = self.lock()?;
        let Some(idx) = arena.index_of(id) else {
            return Ok(ClaimOutcome::Missing);
        };
        let row = &arena.rows[idx];
        if row.status != ExecutionStatus::Pending {
            return Ok(ClaimOutcome::NotPending);
        }
        if row.scheduled_fire_at > now {
            return Ok(ClaimOutcome::NotDue);
        }
        if arena.is_blocked(idx) {
            return Ok(ClaimOutcome::Blocked);
        }
        let lease = Lease::new(now, lease_ttl);
        let row = &mut arena.rows[idx];
        row.status = ExecutionStatus::Executing;
        row.lease_token = Some(lease.token);
        row.lease_expires_at = Some(lease.expires_at);
        row.last_attempt_at = Some(now);
        Ok(ClaimOutcome::Claimed(row.clone()))
    }

    fn complete(&self, id: &ExecutionId, lease_token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut arena = self.lock()?;
        let Some(idx) = arena.index_of(id) else {
            return Ok(false);
        };
        let row = &arena.rows[idx];
        if row.status != ExecutionStatus::Executing || row.lease_token.as_deref() != Some(lease_token) {
            return Ok(false);
        }
        arena.finish(idx, ExecutionStatus::Executed, now);
        Ok(true)
    }

    fn record_failure(
        &self,
        id: &ExecutionId,
        lease_token: &str,
        transition: FailureTransition,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingExecution>> {
        let mut arena = self.lock()?;
        let Some(idx) = arena.index_of(id) else {
            return Ok(None);
        };
        {
            let row = &mut arena.rows[idx];
            if row.status != ExecutionStatus::Executing
                || row.lease_token.as_deref() != Some(lease_token)
            {
                return Ok(None);
            }
            row.attempt_count += 1;
            row.last_error = Some(error.to_string());
        }
        match transition {
            FailureTransition::Retry { next_fire_at } => {
                let row = &mut arena.rows[idx];
                row.status = ExecutionStatus::Pending;
                row.scheduled_fire_at = next_fire_at;
                row.lease_token = None;
                row.lease_expires_at = None;
            }
            FailureTransition::Terminal => arena.finish(idx, ExecutionStatus::FailedTerminal, now),
        }
        Ok(Some(arena.rows[idx].clone()))
    }

    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingExecution>> {
        let arena = self.lock()?;
        Ok(arena
            .rows
            .iter()
            .filter(|r| {
                r.status == ExecutionStatus::Executing && r.lease_expires_at.is_some_and(|t| t < now)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn cancel_pending(&self, filter: &CancelFilter, now: DateTime<Utc>) -> Result<Vec<PendingExecution>> {
        let mut arena = self.lock()?;
        let matches: Vec<usize> = arena
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| filter.matches(r))
            .map(|(idx, _)| idx)
            .collect();
        let mut cancelled = Vec::with_capacity(matches.len());
        for idx in matches {
            arena.finish(idx, ExecutionStatus::Cancelled, now);
            cancelled.push(arena.rows[idx].clone());
        }
        Ok(cancelled)
    }

    fn pending_sequences(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<SequenceId>> {
        let arena = self.lock()?;
        let mut ids: Vec<SequenceId> = arena
            .rows
            .iter()
            .filter(|r| {
                r.status == ExecutionStatus::Pending && r.tenant_id == *tenant_id && r.lead_id == *lead_id
            })
            .map(|r| r.sequence_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn list_for_lead(&self, tenant_id: &TenantId, lead_id: &LeadId) -> Result<Vec<PendingExecution>> {
        let arena = self.lock()?;
        let mut rows: Vec<PendingExecution> = arena
            .rows
            .iter()
            .filter(|r| r.tenant_id == *tenant_id && r.lead_id == *lead_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.sequence_id
                .cmp(&b.sequence_id)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.step_order_index.cmp(&b.step_order_index))
        });
        Ok(rows)
    }

    fn list_by_status(&self, status: ExecutionStatus, limit: usize) -> Result<Vec<PendingExecution>> {
        let arena = self.lock()?;
        let mut rows: Vec<PendingExecution> =
            arena.rows.iter().filter(|r| r.status == status).cloned().collect();
        rows.sort_by(due_order);
        rows.truncate(limit);
        Ok(rows)
    }

    fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, usize>> {
        let arena = self.lock()?;
        let mut counts = BTreeMap::new();
        for row in &arena.rows {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_schedule_is_idempotent_per_activation_key() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let first = store.schedule_activation(&k, steps(&k, &[0, 24]), t0()).unwrap();
        assert_eq!(first.created.len(), 2);
        assert!(!first.duplicate);

        let again = store.schedule_activation(&k, steps(&k, &[0, 24]), t0()).unwrap();
        assert!(again.duplicate);
        assert!(again.created.is_empty());
        assert_eq!(store.status_counts().unwrap()[&ExecutionStatus::Pending], 2);
    }

    #[test]
    fn test_live_slot_uniqueness_across_activations() {
        let store = MemoryExecutionStore::new();
        let a = key("evt-1");
        let b = key("evt-2");
        store.schedule_activation(&a, steps(&a, &[0, 24]), t0()).unwrap();
        let racing = store.schedule_activation(&b, steps(&b, &[0, 24]), t0()).unwrap();
        assert!(racing.created.is_empty());
        assert_eq!(racing.skipped_steps, vec![0, 1]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let created = store.schedule_activation(&k, steps(&k, &[0]), t0()).unwrap().created;
        let id = &created[0].id;

        let first = store.claim(id, t0(), Duration::minutes(5)).unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));
        let second = store.claim(id, t0(), Duration::minutes(5)).unwrap();
        assert_eq!(second, ClaimOutcome::NotPending);
    }

    #[test]
    fn test_claim_respects_fire_time_and_step_order() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let created = store.schedule_activation(&k, steps(&k, &[0, 0, 24]), t0()).unwrap().created;

        assert_eq!(store.claim(&created[2].id, t0(), Duration::minutes(5)).unwrap(), ClaimOutcome::NotDue);
        assert_eq!(store.claim(&created[1].id, t0(), Duration::minutes(5)).unwrap(), ClaimOutcome::Blocked);

        let ClaimOutcome::Claimed(step0) = store.claim(&created[0].id, t0(), Duration::minutes(5)).unwrap()
        else {
            panic!("step 0 should be claimable");
        };
        // Still blocked while step 0 is in flight.
        assert_eq!(store.claim(&created[1].id, t0(), Duration::minutes(5)).unwrap(), ClaimOutcome::Blocked);
        assert!(store.complete(&step0.id, step0.lease_token.as_deref().unwrap(), t0()).unwrap());
        assert!(matches!(
            store.claim(&created[1].id, t0(), Duration::minutes(5)).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn test_complete_requires_matching_lease() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let created = store.schedule_activation(&k, steps(&k, &[0]), t0()).unwrap().created;
        let ClaimOutcome::Claimed(_) = store.claim(&created[0].id, t0(), Duration::minutes(5)).unwrap() else {
            panic!("claim failed");
        };
        assert!(!store.complete(&created[0].id, "someone-else", t0()).unwrap());
        assert_eq!(store.get(&created[0].id).unwrap().unwrap().status, ExecutionStatus::Executing);
    }

    #[test]
    fn test_failure_retry_then_terminal() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let id = store.schedule_activation(&k, steps(&k, &[0]), t0()).unwrap().created[0].id.clone();

        let ClaimOutcome::Claimed(claimed) = store.claim(&id, t0(), Duration::minutes(5)).unwrap() else {
            panic!("claim failed");
        };
        let next = t0() + Duration::hours(1);
        let row = store
            .record_failure(
                &id,
                claimed.lease_token.as_deref().unwrap(),
                FailureTransition::Retry { next_fire_at: next },
                "503",
                t0(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.scheduled_fire_at, next);

        let ClaimOutcome::Claimed(claimed) = store.claim(&id, next, Duration::minutes(5)).unwrap() else {
            panic!("re-claim failed");
        };
        let row = store
            .record_failure(&id, claimed.lease_token.as_deref().unwrap(), FailureTransition::Terminal, "bounced", next)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::FailedTerminal);
        assert_eq!(row.attempt_count, 2);

        // Terminal rows free their slot for a later activation.
        let k2 = key("evt-2");
        let again = store.schedule_activation(&k2, steps(&k2, &[0]), next).unwrap();
        assert_eq!(again.created.len(), 1);
    }

    #[test]
    fn test_cancel_only_touches_pending() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let created = store.schedule_activation(&k, steps(&k, &[0, 24, 72]), t0()).unwrap().created;
        let ClaimOutcome::Claimed(step0) = store.claim(&created[0].id, t0(), Duration::minutes(5)).unwrap()
        else {
            panic!("claim failed");
        };
        store.complete(&step0.id, step0.lease_token.as_deref().unwrap(), t0()).unwrap();

        let filter = CancelFilter::lead(&TenantId::from("acme"), &LeadId::from("lead-1"));
        let cancelled = store.cancel_pending(&filter, t0()).unwrap();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(store.get(&created[0].id).unwrap().unwrap().status, ExecutionStatus::Executed);
        assert!(store
            .pending_sequences(&TenantId::from("acme"), &LeadId::from("lead-1"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_expired_leases() {
        let store = MemoryExecutionStore::new();
        let k = key("evt-1");
        let id = store.schedule_activation(&k, steps(&k, &[0]), t0()).unwrap().created[0].id.clone();
        store.claim(&id, t0(), Duration::minutes(5)).unwrap();
        assert!(store.expired_leases(t0() + Duration::minutes(4), 10).unwrap().is_empty());
        assert_eq!(store.expired_leases(t0() + Duration::minutes(6), 10).unwrap().len(), 1);
    }
}
