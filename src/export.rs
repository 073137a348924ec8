use std::collections::BTreeMap;
use std::fs;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use crate::artifact::Table;
use crate::error::DromaError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub export_id: String,
    pub cache_key: String,
    pub path: Utf8PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ExportStore {
    root: Utf8PathBuf,
    records: RwLock<BTreeMap<String, ExportRecord>>,
}

impl ExportStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn export_table(
        &self,
        cache_key: &str,
        table: &Table,
        filename: Option<&str>,
    ) -> Result<ExportRecord, DromaError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| DromaError::StatePoisoned("export store".to_string()))?;
        let filename = match filename {
            Some(name) => sanitize_filename(name),
            None => (records.len()..)
                .map(|n| format!("droma_analysis_{n}"))
                .find(|id| !records.contains_key(id))
                .map(|id| format!("{id}.csv"))
                .unwrap_or_else(|| "droma_analysis.csv".to_string()),
        };
        let export_id = filename.trim_end_matches(".csv").to_string();
        let path = self.root.join(&filename);
        let content = table_to_csv(table);
        write_bytes_atomic(&path, content.as_bytes())?;

        let record = ExportRecord {
            export_id: export_id.clone(),
            cache_key: cache_key.to_string(),
            path,
            filename,
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        };
        records.insert(export_id, record.clone());
        Ok(record)
    }

    pub fn get(&self, export_id: &str) -> Option<ExportRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(export_id)
            .filter(|record| record.path.as_std_path().exists())
            .cloned()
    }

    pub fn list(&self) -> Vec<ExportRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|record| record.path.as_std_path().exists())
            .cloned()
            .collect()
    }

    pub fn sweep(&self, max_age: Duration) -> Result<usize, DromaError> {
        let Some(cutoff) = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut records = self
            .records
            .write()
            .map_err(|_| DromaError::StatePoisoned("export store".to_string()))?;
        let stale: Vec<String> = records
            .values()
            .filter(|record| record.created_at <= cutoff)
            .map(|record| record.export_id.clone())
            .collect();
        let mut removed = 0;
        for export_id in stale {
            let Some(record) = records.get(&export_id) else {
                continue;
            };
            if record.path.as_std_path().exists()
                && let Err(err) = fs::remove_file(record.path.as_std_path())
            {
                warn!(%export_id, error = %err, "failed to delete stale export");
                continue;
            }
            records.remove(&export_id);
            removed += 1;
        }
        Ok(removed)
    }
}

pub fn table_to_csv(table: &Table) -> String {
    let mut out = String::from("feature");
    for sample in table.samples() {
        out.push(',');
        out.push_str(&csv_field(sample));
    }
    out.push('\n');
    for (index, feature) in table.features().iter().enumerate() {
        out.push_str(&csv_field(feature));
        for cell in table.row(index).unwrap_or_default() {
            out.push(',');
            if let Some(value) = cell.filter(|value| value.is_finite()) {
                out.push_str(&value.to_string());
            }
        }
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn sanitize_filename(name: &str) -> String {
    let stem: String = name
        .trim()
        .trim_end_matches(".csv")
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    let stem = if stem.is_empty() { "export" } else { stem };
    format!("{stem}.csv")
}

fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DromaError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DromaError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("csv.tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| DromaError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| DromaError::Filesystem(err.to_string()))?;
    Ok(())
}
