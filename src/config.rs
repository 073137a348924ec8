use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::audit::AuditThresholds;
use crate::domain::{DatasetId, DatasetKind};
use crate::error::DromaError;

pub const DEFAULT_CONFIG_FILE: &str = "droma-broker.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub rscript: Option<String>,
    #[serde(default)]
    pub r_libs: Option<String>,
    #[serde(default)]
    pub workspace_dir: Option<String>,
    #[serde(default)]
    pub exports_dir: Option<String>,
    #[serde(default)]
    pub cache_max_age_hours: Option<u64>,
    #[serde(default)]
    pub audit: Option<AuditThresholds>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub id: String,
    #[serde(default)]
    pub kind: Option<DatasetKind>,
    #[serde(default)]
    pub set_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetPreload {
    pub id: DatasetId,
    pub kind: DatasetKind,
    pub set_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub db_path: Option<Utf8PathBuf>,
    pub rscript: Option<PathBuf>,
    pub r_libs: Option<String>,
    pub workspace_dir: Utf8PathBuf,
    pub exports_dir: Utf8PathBuf,
    pub cache_max_age: Duration,
    pub audit: AuditThresholds,
    pub datasets: Vec<DatasetPreload>,
}

impl ResolvedConfig {
    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self {
            schema_version: 1,
            db_path: None,
            rscript: None,
            r_libs: None,
            workspace_dir: root.join("workspace"),
            exports_dir: root.join("exports"),
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_HOURS * 3600),
            audit: AuditThresholds::default(),
            datasets: Vec::new(),
        }
    }
}

const DEFAULT_CACHE_MAX_AGE_HOURS: u64 = 24;

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DromaError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| DromaError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| DromaError::ConfigParse(err.to_string()))?
        };

        let config = Self::apply_env(config, |name| std::env::var(name).ok());
        Self::resolve_config(config, default_root()?)
    }

    pub fn apply_env(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
        if let Some(db_path) = lookup("DROMA_DB_PATH").filter(|value| !value.is_empty()) {
            config.db_path = Some(db_path);
        }
        if let Some(r_libs) = lookup("R_LIBS").filter(|value| !value.is_empty()) {
            config.r_libs = Some(r_libs);
        }
        config
    }

    pub fn resolve_config(config: Config, root: Utf8PathBuf) -> Result<ResolvedConfig, DromaError> {
        let defaults = ResolvedConfig::with_root(root);

        let datasets = config
            .datasets
            .into_iter()
            .map(|entry| match entry {
                DatasetEntry::Shorthand(value) => {
                    let id: DatasetId = value.parse()?;
                    Ok(DatasetPreload {
                        kind: id.default_kind(),
                        id,
                        set_active: true,
                    })
                }
                DatasetEntry::Detailed(obj) => {
                    let id: DatasetId = obj.id.parse()?;
                    Ok(DatasetPreload {
                        kind: obj.kind.unwrap_or_else(|| id.default_kind()),
                        id,
                        set_active: obj.set_active.unwrap_or(true),
                    })
                }
            })
            .collect::<Result<Vec<_>, DromaError>>()?;

        let audit = config.audit.unwrap_or_default();
        if !(audit.mean_tolerance > 0.0 && audit.std_lower < audit.std_upper) {
            return Err(DromaError::ConfigParse(format!(
                "invalid audit thresholds: {audit:?}"
            )));
        }

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            db_path: config.db_path.map(Utf8PathBuf::from),
            rscript: config.rscript.map(PathBuf::from),
            r_libs: config.r_libs,
            workspace_dir: config
                .workspace_dir
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            exports_dir: config
                .exports_dir
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.exports_dir),
            cache_max_age: config
                .cache_max_age_hours
                .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
                .unwrap_or(defaults.cache_max_age),
            audit,
            datasets,
        })
    }
}

fn default_root() -> Result<Utf8PathBuf, DromaError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".droma-broker")).ok())
        .ok_or_else(|| DromaError::Filesystem("unable to resolve home directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_entries_infer_kind() {
        let config = Config {
            datasets: vec![
                DatasetEntry::Shorthand("CCLE".to_string()),
                DatasetEntry::Shorthand("CCLE,gCSI".to_string()),
            ],
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config, Utf8PathBuf::from("/tmp/droma")).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.datasets[0].kind, DatasetKind::Single);
        assert_eq!(resolved.datasets[1].kind, DatasetKind::Multi);
        assert_eq!(resolved.workspace_dir, Utf8PathBuf::from("/tmp/droma/workspace"));
        assert_eq!(resolved.cache_max_age, Duration::from_secs(24 * 3600));
    }
}
