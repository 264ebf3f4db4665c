//! Lifecycle event inbox: how upstream events reach the engine.
//!
//! The surrounding system appends events; workers claim batches in arrival
//! order, process them and mark them done. Delivery is at-least-once: a
//! claim that is never resolved becomes claimable again after `stale_after`.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::{LeadPulseError, LifecycleEvent, Result};

#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub seq: i64,
    pub event: LifecycleEvent,
}

pub trait EventInbox: Send + Sync {
    fn enqueue(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> Result<i64>;

    fn claim_batch(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<InboxEntry>>;

    fn mark_processed(&self, seq: i64, error: Option<&str>, now: DateTime<Utc>) -> Result<()>;
}

struct Slot {
    entry: InboxEntry,
    claimed_at: Option<DateTime<Utc>>,
    processed: bool,
}

#[derive(Default)]
pub struct MemoryInbox {
    slots: Mutex<Vec<Slot>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unprocessed(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().filter(|slot| !slot.processed).count())
            .unwrap_or(0)
    }
}

impl EventInbox for MemoryInbox {
    fn enqueue(&self, event: &LifecycleEvent, _now: DateTime<Utc>) -> Result<i64> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| LeadPulseError::Store("inbox lock poisoned".into()))?;
        let seq = slots.len() as i64 + 1;
        slots.push(Slot {
            entry: InboxEntry {
                seq,
                event: event.clone(),
            },
            claimed_at: None,
            processed: false,
        });
        Ok(seq)
    }

    fn claim_batch(
        &self,
        _worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<InboxEntry>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| LeadPulseError::Store("inbox lock poisoned".into()))?;
        let mut batch = Vec::new();
        for slot in slots.iter_mut() {
            if batch.len() >= limit {
                break;
            }
            let claimable = !slot.processed
                && slot.claimed_at.is_none_or(|at| at + stale_after < now);
            if claimable {
                slot.claimed_at = Some(now);
                batch.push(slot.entry.clone());
            }
        }
        Ok(batch)
    }

    fn mark_processed(&self, seq: i64, error: Option<&str>, _now: DateTime<Utc>) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| LeadPulseError::Store("inbox lock poisoned".into()))?;
        if let Some(slot) = slots.iter_mut().find(|s| s.entry.seq == seq) {
            slot.processed = true;
            if let Some(err) = error {
                tracing::warn!("⚠️ Inbox event #{seq} finished with error: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_claim_in_order_and_reclaim_stale() {
        let inbox = MemoryInbox::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        for i in 0..3 {
            let event = LifecycleEvent::stage_changed(&format!("evt-{i}"), "acme", "lead-1", None, "trial", t0);
            inbox.enqueue(&event, t0).unwrap();
        }

        let batch = inbox.claim_batch("w1", t0, 2, Duration::minutes(5)).unwrap();
        assert_eq!(batch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        inbox.mark_processed(1, None, t0).unwrap();

        // Entry 2 is still claimed by w1; only 3 is free.
        let batch = inbox.claim_batch("w2", t0, 10, Duration::minutes(5)).unwrap();
        assert_eq!(batch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3]);

        // After the claim goes stale, 2 and 3 come back.
        let later = t0 + Duration::minutes(6);
        let batch = inbox.claim_batch("w2", later, 10, Duration::minutes(5)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(inbox.unprocessed(), 2);
    }
}
