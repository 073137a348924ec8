use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, Table};
use crate::cache::CacheEntry;
use crate::error::DromaError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuditThresholds {
    pub mean_tolerance: f64,
    pub std_lower: f64,
    pub std_upper: f64,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            mean_tolerance: 0.1,
            std_lower: 0.8,
            std_upper: 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl SampleStats {
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().filter(|value| value.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            let squares: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
            (squares / (count - 1) as f64).sqrt()
        } else {
            0.0
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count,
            mean,
            std,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AuditResult {
    pub claimed_normalized: bool,
    pub observed_mean_near_zero: bool,
    pub observed_unit_variance: bool,
    pub sample_stats: SampleStats,
}

impl AuditResult {
    pub fn looks_normalized(&self) -> bool {
        self.observed_mean_near_zero && self.observed_unit_variance
    }

    pub fn is_mismatch(&self) -> bool {
        self.claimed_normalized != self.looks_normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AuditReport {
    Single(AuditResult),
    PerProject(BTreeMap<String, AuditResult>),
}

impl AuditReport {
    pub fn has_mismatch(&self) -> bool {
        match self {
            AuditReport::Single(result) => result.is_mismatch(),
            AuditReport::PerProject(results) => results.values().any(AuditResult::is_mismatch),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizationAuditor {
    thresholds: AuditThresholds,
}

impl NormalizationAuditor {
    pub fn new(thresholds: AuditThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> AuditThresholds {
        self.thresholds
    }

    pub fn audit(&self, entry: &CacheEntry) -> Result<AuditReport, DromaError> {
        let claimed = entry.provenance.normalization_requested;
        match entry.artifact.as_ref() {
            Artifact::Table(table) => self
                .audit_table(table, claimed)
                .map(AuditReport::Single)
                .ok_or_else(|| DromaError::EmptyData(entry.key.clone())),
            Artifact::Projects(projects) => {
                let mut results = BTreeMap::new();
                for (project, table) in projects {
                    let result = self.audit_table(table, claimed).ok_or_else(|| {
                        DromaError::EmptyData(format!("{} (project {project})", entry.key))
                    })?;
                    results.insert(project.clone(), result);
                }
                if results.is_empty() {
                    return Err(DromaError::EmptyData(entry.key.clone()));
                }
                Ok(AuditReport::PerProject(results))
            }
            Artifact::Opaque { description } => Err(DromaError::EmptyData(format!(
                "{} holds a non-tabular result ({description})",
                entry.key
            ))),
        }
    }

    pub fn classify(&self, stats: SampleStats, claimed_normalized: bool) -> AuditResult {
        let AuditThresholds {
            mean_tolerance,
            std_lower,
            std_upper,
        } = self.thresholds;
        AuditResult {
            claimed_normalized,
            observed_mean_near_zero: stats.mean.abs() < mean_tolerance,
            observed_unit_variance: std_lower < stats.std && stats.std < std_upper,
            sample_stats: stats,
        }
    }

    fn audit_table(&self, table: &Table, claimed: bool) -> Option<AuditResult> {
        let stats = SampleStats::from_values(table.cells().iter().flatten().copied())?;
        Some(self.classify(stats, claimed))
    }
}
