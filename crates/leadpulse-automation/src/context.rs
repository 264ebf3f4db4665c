//! Lead anchor projection: the engine's local view of anchor timestamps.
//!
//! CONTEXT_UPDATED events are folded in here; TIME_TICK sweeps read from it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use leadpulse_core::{LeadContextSource, LeadId, LeadPulseError, Result, TenantId};

pub trait AnchorProjection: LeadContextSource {
    /// Set (`Some`) or clear (`None`) a lead's anchor.
    fn record_anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
        value: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Every lead with at least one known anchor.
    fn anchored_leads(&self) -> Result<Vec<(TenantId, LeadId)>>;
}

type AnchorKey = (TenantId, LeadId, String);

#[derive(Default)]
pub struct MemoryAnchors {
    anchors: RwLock<BTreeMap<AnchorKey, DateTime<Utc>>>,
}

impl MemoryAnchors {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeadContextSource for MemoryAnchors {
    fn anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let anchors = self
            .anchors
            .read()
            .map_err(|_| LeadPulseError::Store("anchor lock poisoned".into()))?;
        Ok(anchors
            .get(&(tenant_id.clone(), lead_id.clone(), anchor.to_string()))
            .copied())
    }
}

impl AnchorProjection for MemoryAnchors {
    fn record_anchor(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        anchor: &str,
        value: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut anchors = self
            .anchors
            .write()
            .map_err(|_| LeadPulseError::Store("anchor lock poisoned".into()))?;
        let key = (tenant_id.clone(), lead_id.clone(), anchor.to_string());
        match value {
            Some(v) => {
                anchors.insert(key, v);
            }
            None => {
                anchors.remove(&key);
            }
        }
        Ok(())
    }

    fn anchored_leads(&self) -> Result<Vec<(TenantId, LeadId)>> {
        let anchors = self
            .anchors
            .read()
            .map_err(|_| LeadPulseError::Store("anchor lock poisoned".into()))?;
        let mut leads: Vec<(TenantId, LeadId)> = anchors
            .keys()
            .map(|(tenant, lead, _)| (tenant.clone(), lead.clone()))
            .collect();
        leads.dedup();
        Ok(leads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_read_and_clear() {
        let anchors = MemoryAnchors::new();
        let tenant = TenantId::from("acme");
        let lead = LeadId::from("lead-1");
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap();

        anchors.record_anchor(&tenant, &lead, "webinar_at", Some(at)).unwrap();
        anchors.record_anchor(&tenant, &lead, "demo_at", Some(at)).unwrap();
        assert_eq!(anchors.anchor(&tenant, &lead, "webinar_at").unwrap(), Some(at));
        assert_eq!(anchors.anchored_leads().unwrap(), vec![(tenant.clone(), lead.clone())]);

        anchors.record_anchor(&tenant, &lead, "webinar_at", None).unwrap();
        assert_eq!(anchors.anchor(&tenant, &lead, "webinar_at").unwrap(), None);
    }
}
