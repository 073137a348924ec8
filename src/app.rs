use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactSummary};
use crate::audit::{AuditReport, AuditThresholds, NormalizationAuditor};
use crate::bridge::{OperationParams, RuntimeBridge};
use crate::cache::{EntrySummary, Provenance, ResultCache, derive_key};
use crate::config::ResolvedConfig;
use crate::domain::{DataType, DatasetId, DatasetKind, MolecularType, Operation};
use crate::error::DromaError;
use crate::export::{ExportRecord, ExportStore};
use crate::registry::{DatasetRegistry, LoadOutcome, RegistryListing, UnloadOutcome};

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub dataset_id: DatasetId,
    pub kind: DatasetKind,
    pub db_path: Option<Utf8PathBuf>,
    pub set_active: bool,
}

#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: Operation,
    pub dataset: Option<DatasetId>,
    pub molecular_type: Option<MolecularType>,
    pub features: Option<Vec<String>>,
    pub drugs: Option<Vec<String>>,
    pub overlap_only: bool,
    pub data_type: DataType,
    pub tumor_type: String,
    pub zscore: bool,
}

impl OperationRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            dataset: None,
            molecular_type: None,
            features: None,
            drugs: None,
            overlap_only: false,
            data_type: DataType::All,
            tumor_type: "all".to_string(),
            zscore: true,
        }
    }

    pub fn molecular_profiles(dataset: Option<DatasetId>, molecular_type: MolecularType) -> Self {
        Self {
            dataset,
            molecular_type: Some(molecular_type),
            ..Self::new(Operation::MolecularProfiles)
        }
    }

    pub fn treatment_response(dataset: Option<DatasetId>) -> Self {
        Self {
            dataset,
            ..Self::new(Operation::TreatmentResponse)
        }
    }

    fn params(&self) -> OperationParams {
        let multi = self.operation.dataset_kind() == DatasetKind::Multi;
        OperationParams {
            molecular_type: self
                .molecular_type
                .filter(|_| self.operation.needs_molecular_type()),
            features: self
                .features
                .clone()
                .filter(|_| self.operation.needs_molecular_type()),
            drugs: self
                .drugs
                .clone()
                .filter(|_| !self.operation.needs_molecular_type()),
            overlap_only: multi.then_some(self.overlap_only),
            data_type: self.data_type,
            tumor_type: self.tumor_type.clone(),
            zscore: self.zscore,
        }
    }

    fn provenance(&self) -> Provenance {
        let params = self.params();
        Provenance {
            operation: self.operation,
            normalization_requested: self.zscore,
            molecular_type: params.molecular_type,
            features: params.features,
            drugs: params.drugs,
            overlap_only: params.overlap_only,
            data_type: params.data_type,
            tumor_type: params.tumor_type,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub status: &'static str,
    pub dataset_id: String,
    pub kind: DatasetKind,
    pub outcome: LoadOutcome,
    pub loaded: RegistryListing,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnloadResult {
    pub status: &'static str,
    pub dataset_id: String,
    pub kind: DatasetKind,
    pub message: String,
    pub outcome: UnloadOutcome,
    pub remaining: RegistryListing,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetDetail {
    pub dataset_id: String,
    pub kind: DatasetKind,
    pub runtime_ref: String,
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetList {
    #[serde(flatten)]
    pub listing: RegistryListing,
    pub total_loaded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<DatasetDetail>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub cache_key: String,
    pub operation: Operation,
    pub dataset_id: String,
    pub normalization_requested: bool,
    pub summary: ArtifactSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizationCheck {
    pub cache_key: String,
    pub report: AuditReport,
    pub mismatch: bool,
    pub normalization_applicable: Option<bool>,
    pub thresholds: AuditThresholds,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CacheInfo {
    Entry(EntrySummary),
    All {
        cached_items: Vec<EntrySummary>,
        total_items: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub cache_entries_removed: usize,
    pub exports_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadFailure {
    pub dataset_id: String,
    pub kind: DatasetKind,
    pub message: String,
}

pub struct Broker<B: RuntimeBridge> {
    config: ResolvedConfig,
    registry: DatasetRegistry,
    cache: ResultCache,
    auditor: NormalizationAuditor,
    exports: ExportStore,
    bridge: Mutex<B>,
}

impl<B: RuntimeBridge> Broker<B> {
    pub fn new(config: ResolvedConfig, bridge: B) -> Self {
        let auditor = NormalizationAuditor::new(config.audit);
        let exports = ExportStore::new(config.exports_dir.clone());
        Self {
            config,
            registry: DatasetRegistry::new(),
            cache: ResultCache::new(),
            auditor,
            exports,
            bridge: Mutex::new(bridge),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn exports(&self) -> &ExportStore {
        &self.exports
    }

    pub fn preload(&self) -> Vec<PreloadFailure> {
        let mut failures = Vec::new();
        for preload in &self.config.datasets {
            let request = LoadRequest {
                dataset_id: preload.id.clone(),
                kind: preload.kind,
                db_path: None,
                set_active: preload.set_active,
            };
            if let Err(err) = self.load_dataset(&request) {
                warn!(dataset = %preload.id, error = %err, "preload failed");
                failures.push(PreloadFailure {
                    dataset_id: preload.id.to_string(),
                    kind: preload.kind,
                    message: err.to_string(),
                });
            }
        }
        failures
    }

    pub fn load_dataset(&self, request: &LoadRequest) -> Result<LoadResult, DromaError> {
        let db_path = request
            .db_path
            .clone()
            .or_else(|| self.config.db_path.clone())
            .ok_or_else(|| {
                DromaError::SourceNotFound(
                    "no database path configured (set DROMA_DB_PATH or db_path)".to_string(),
                )
            })?;
        let outcome = {
            let mut bridge = self.bridge()?;
            self.registry.load(
                &mut *bridge,
                &request.dataset_id,
                request.kind,
                &db_path,
                request.set_active,
            )?
        };
        Ok(LoadResult {
            status: "success",
            dataset_id: request.dataset_id.to_string(),
            kind: request.kind,
            outcome,
            loaded: self.registry.list(),
        })
    }

    pub fn unload_dataset(
        &self,
        dataset_id: &DatasetId,
        kind: DatasetKind,
    ) -> Result<UnloadResult, DromaError> {
        let outcome = {
            let mut bridge = self.bridge()?;
            self.registry.unload(&mut *bridge, dataset_id, kind)?
        };
        let (status, message) = match outcome {
            UnloadOutcome::Unloaded { .. } => (
                "success",
                format!("Successfully unloaded dataset '{dataset_id}'"),
            ),
            UnloadOutcome::NotLoaded => (
                "warning",
                format!("{} '{dataset_id}' is not loaded", kind.label()),
            ),
        };
        Ok(UnloadResult {
            status,
            dataset_id: dataset_id.to_string(),
            kind,
            message,
            outcome,
            remaining: self.registry.list(),
        })
    }

    pub fn set_active_dataset(
        &self,
        dataset_id: &DatasetId,
        kind: DatasetKind,
    ) -> Result<RegistryListing, DromaError> {
        self.registry.set_active(dataset_id, kind)?;
        Ok(self.registry.list())
    }

    pub fn list_datasets(&self, include_details: bool) -> DatasetList {
        let listing = self.registry.list();
        let total_loaded = listing.single_ids.len() + listing.multi_ids.len();
        let details = include_details.then(|| {
            [DatasetKind::Single, DatasetKind::Multi]
                .into_iter()
                .flat_map(|kind| self.registry.handles(kind))
                .map(|handle| DatasetDetail {
                    is_active: self.registry.is_active(&handle.id, handle.kind),
                    dataset_id: handle.id.to_string(),
                    kind: handle.kind,
                    runtime_ref: handle.runtime_ref.to_string(),
                    source: handle.source.to_string(),
                    loaded_at: handle.loaded_at,
                })
                .collect()
        });
        DatasetList {
            listing,
            total_loaded,
            details,
        }
    }

    pub fn run_operation(&self, request: &OperationRequest) -> Result<OperationResult, DromaError> {
        let operation = request.operation;
        if operation.needs_molecular_type() && request.molecular_type.is_none() {
            return Err(DromaError::MissingMolecularType(operation.to_string()));
        }
        let kind = operation.dataset_kind();
        let params = request.params();

        // Resolve and invoke under the bridge lock so the handle cannot be
        // released in between.
        let (dataset_id, artifact) = {
            let mut bridge = self.bridge()?;
            let handle = self
                .registry
                .resolve(request.dataset.as_ref(), kind)
                .ok_or_else(|| match &request.dataset {
                    Some(id) => DromaError::DatasetNotFound(format!("{} {id}", kind.label())),
                    None => DromaError::DatasetNotFound(format!("no active {}", kind.label())),
                })?;
            let raw = bridge
                .invoke(operation, &handle.runtime_ref, &params)
                .map_err(|err| err.annotate(format!("{operation} failed for {}", handle.id)))?;
            (handle.id, bridge.to_canonical(raw))
        };

        let discriminator = params.molecular_type.map(|kind| kind.as_str());
        let cache_key = derive_key(operation.name(), dataset_id.as_str(), discriminator);
        let entry = self
            .cache
            .put(cache_key.clone(), artifact, request.provenance())?;
        let summary = entry.artifact.summary();
        info!(%cache_key, %operation, dataset = %dataset_id, "operation result cached");

        Ok(OperationResult {
            cache_key,
            operation,
            dataset_id: dataset_id.to_string(),
            normalization_requested: request.zscore,
            summary,
        })
    }

    pub fn check_normalization(&self, cache_key: &str) -> Result<NormalizationCheck, DromaError> {
        let entry = self
            .cache
            .get(cache_key)
            .ok_or_else(|| DromaError::CacheEntryNotFound(cache_key.to_string()))?;
        let report = self.auditor.audit(&entry)?;
        Ok(NormalizationCheck {
            cache_key: entry.key.clone(),
            mismatch: report.has_mismatch(),
            normalization_applicable: entry
                .provenance
                .molecular_type
                .map(|kind| kind.is_continuous()),
            report,
            thresholds: self.auditor.thresholds(),
            provenance: entry.provenance,
        })
    }

    pub fn cached_info(&self, cache_key: Option<&str>) -> Result<CacheInfo, DromaError> {
        match cache_key {
            Some(key) => self
                .cache
                .get(key)
                .map(|entry| CacheInfo::Entry(entry.summary()))
                .ok_or_else(|| DromaError::CacheEntryNotFound(key.to_string())),
            None => {
                let cached_items = self.cache.list();
                Ok(CacheInfo::All {
                    total_items: cached_items.len(),
                    cached_items,
                })
            }
        }
    }

    pub fn export_cached(
        &self,
        cache_key: &str,
        filename: Option<&str>,
    ) -> Result<ExportRecord, DromaError> {
        let entry = self
            .cache
            .get(cache_key)
            .ok_or_else(|| DromaError::CacheEntryNotFound(cache_key.to_string()))?;
        match entry.artifact.as_ref() {
            Artifact::Table(table) => self.exports.export_table(cache_key, table, filename),
            Artifact::Projects(_) => Err(DromaError::NotExportable(format!(
                "{cache_key} holds one table per project"
            ))),
            Artifact::Opaque { description } => Err(DromaError::NotExportable(format!(
                "{cache_key} holds a non-tabular result ({description})"
            ))),
        }
    }

    pub fn sweep(&self, max_age: Option<Duration>) -> Result<SweepResult, DromaError> {
        let max_age = max_age.unwrap_or(self.config.cache_max_age);
        Ok(SweepResult {
            cache_entries_removed: self.cache.evict_older_than(max_age)?,
            exports_removed: self.exports.sweep(max_age)?,
        })
    }

    pub fn clear_cache(&self) -> Result<usize, DromaError> {
        self.cache.clear()
    }

    pub fn shutdown(self) -> B {
        let mut bridge = self
            .bridge
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let released = self.registry.drain(&mut bridge);
        info!(released, "broker shut down");
        bridge
    }

    fn bridge(&self) -> Result<MutexGuard<'_, B>, DromaError> {
        self.bridge
            .lock()
            .map_err(|_| DromaError::StatePoisoned("runtime bridge".to_string()))
    }
}
