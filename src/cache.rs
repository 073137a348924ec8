use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactSummary};
use crate::domain::{DataType, MolecularType, Operation};
use crate::error::DromaError;

/// Parameters that produced a cached artifact. `normalization_requested`
/// records what the caller asked for, not what the data looks like.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub operation: Operation,
    pub normalization_requested: bool,
    pub molecular_type: Option<MolecularType>,
    pub features: Option<Vec<String>>,
    pub drugs: Option<Vec<String>>,
    pub overlap_only: Option<bool>,
    pub data_type: DataType,
    pub tumor_type: String,
}

impl Provenance {
    pub fn new(operation: Operation, normalization_requested: bool) -> Self {
        Self {
            operation,
            normalization_requested,
            molecular_type: None,
            features: None,
            drugs: None,
            overlap_only: None,
            data_type: DataType::All,
            tumor_type: "all".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub artifact: Arc<Artifact>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            key: self.key.clone(),
            artifact: self.artifact.summary(),
            provenance: self.provenance.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub artifact: ArtifactSummary,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    state: RwLock<CacheState>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        key: impl Into<String>,
        artifact: Artifact,
        provenance: Provenance,
    ) -> Result<CacheEntry, DromaError> {
        let key = key.into();
        let mut state = self.write()?;
        let now = Utc::now();
        // Strictly increasing, even if the wall clock steps back.
        let created_at = match state.last_created {
            Some(last) if last >= now => last + TimeDelta::nanoseconds(1),
            _ => now,
        };
        state.last_created = Some(created_at);
        let entry = CacheEntry {
            key: key.clone(),
            artifact: Arc::new(artifact),
            provenance,
            created_at,
        };
        let replaced = state.entries.insert(key.clone(), entry.clone()).is_some();
        debug!(%key, replaced, "cached artifact");
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read().entries.get(key).cloned()
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        let mut summaries: Vec<EntrySummary> =
            self.read().entries.values().map(CacheEntry::summary).collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize, DromaError> {
        self.evict_older_than_at(Utc::now(), max_age)
    }

    pub fn evict_older_than_at(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<usize, DromaError> {
        let Some(cutoff) = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut state = self.write()?;
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.created_at > cutoff);
        let removed = before - state.entries.len();
        if removed > 0 {
            info!(removed, %cutoff, "evicted stale cache entries");
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, DromaError> {
        let mut state = self.write()?;
        let removed = state.entries.len();
        state.entries.clear();
        info!(removed, "cache cleared");
        Ok(removed)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>, DromaError> {
        self.state
            .write()
            .map_err(|_| DromaError::StatePoisoned("result cache".to_string()))
    }
}

pub fn derive_key(operation: &str, dataset_id: &str, discriminator: Option<&str>) -> String {
    let mut key = String::new();
    escape_into(&mut key, operation);
    key.push(':');
    escape_into(&mut key, dataset_id);
    if let Some(discriminator) = discriminator {
        key.push(':');
        escape_into(&mut key, discriminator);
    }
    key
}

fn escape_into(out: &mut String, segment: &str) {
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
}
