//! Sequence catalog: read access to sequence definitions.
//!
//! Definitions are edited out-of-band (import, admin tooling); the engine only
//! reads them. Two implementations ship: [`MemoryCatalog`] for embedding and
//! tests, and the SQLite-backed [`crate::persistence::AutomationDb`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use leadpulse_core::{LeadPulseError, Result, SequenceId, TenantScope};
use serde::{Deserialize, Serialize};

use crate::sequence::{SequenceDefinition, TriggerKind};

pub trait SequenceCatalog: Send + Sync {
    /// Active definitions owned by exactly `scope` with the given trigger kind.
    fn list_active_sequences(
        &self,
        scope: &TenantScope,
        kind: TriggerKind,
    ) -> Result<Vec<SequenceDefinition>>;

    /// Fetch one definition regardless of its `active` flag.
    fn get(&self, id: &SequenceId) -> Result<Option<SequenceDefinition>>;

    fn list_all(&self) -> Result<Vec<SequenceDefinition>>;

    /// Insert or replace a definition. Rejects invalid definitions.
    fn upsert(&self, definition: SequenceDefinition) -> Result<()>;
}

/// In-process catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    sequences: RwLock<BTreeMap<SequenceId, SequenceDefinition>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequences(definitions: Vec<SequenceDefinition>) -> Result<Self> {
        let catalog = Self::new();
        for definition in definitions {
            catalog.upsert(definition)?;
        }
        Ok(catalog)
    }
}

impl SequenceCatalog for MemoryCatalog {
    fn list_active_sequences(
        &self,
        scope: &TenantScope,
        kind: TriggerKind,
    ) -> Result<Vec<SequenceDefinition>> {
        let sequences = self
            .sequences
            .read()
            .map_err(|_| LeadPulseError::Catalog("catalog lock poisoned".into()))?;
        Ok(sequences
            .values()
            .filter(|s| s.active && s.tenant_scope == *scope && s.kind() == kind)
            .cloned()
            .collect())
    }

    fn get(&self, id: &SequenceId) -> Result<Option<SequenceDefinition>> {
        let sequences = self
            .sequences
            .read()
            .map_err(|_| LeadPulseError::Catalog("catalog lock poisoned".into()))?;
        Ok(sequences.get(id).cloned())
    }

    fn list_all(&self) -> Result<Vec<SequenceDefinition>> {
        let sequences = self
            .sequences
            .read()
            .map_err(|_| LeadPulseError::Catalog("catalog lock poisoned".into()))?;
        Ok(sequences.values().cloned().collect())
    }

    fn upsert(&self, definition: SequenceDefinition) -> Result<()> {
        definition.validate()?;
        let mut sequences = self
            .sequences
            .write()
            .map_err(|_| LeadPulseError::Catalog("catalog lock poisoned".into()))?;
        tracing::info!("📚 Sequence upserted: '{}' ({})", definition.id, definition.tenant_scope);
        sequences.insert(definition.id.clone(), definition);
        Ok(())
    }
}

/// TOML file of `[[sequence]]` tables, used for bulk import.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SequenceFile {
    #[serde(rename = "sequence", default)]
    pub sequences: Vec<SequenceDefinition>,
}

impl SequenceFile {
    pub fn parse(content: &str) -> Result<Vec<SequenceDefinition>> {
        let file: SequenceFile = toml::from_str(content)
            .map_err(|e| LeadPulseError::Catalog(format!("Failed to parse sequence file: {e}")))?;
        for definition in &file.sequences {
            definition.validate()?;
        }
        Ok(file.sequences)
    }

    pub fn load(path: &Path) -> Result<Vec<SequenceDefinition>> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

/// Import every definition from `path` into `catalog`. Returns the count.
pub fn import_file(catalog: &dyn SequenceCatalog, path: &Path) -> Result<usize> {
    let definitions = SequenceFile::load(path)?;
    let count = definitions.len();
    for definition in definitions {
        catalog.upsert(definition)?;
    }
    tracing::info!("📥 Imported {count} sequence(s) from {}", path.display());
    Ok(count)
}
