use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use droma_broker::audit::AuditThresholds;
use droma_broker::config::{Config, ConfigLoader, DatasetEntry, DatasetEntryObject};
use droma_broker::domain::DatasetKind;
use droma_broker::error::DromaError;

fn root() -> Utf8PathBuf {
    Utf8PathBuf::from("/srv/droma")
}

#[test]
fn parse_config_file() {
    let config: Config = serde_json::from_str(
        r#"{
            "schema_version": 1,
            "db_path": "/data/droma.sqlite",
            "rscript": "/usr/local/bin/Rscript",
            "cache_max_age_hours": 6,
            "audit": {"mean_tolerance": 0.05, "std_lower": 0.9, "std_upper": 1.1},
            "datasets": [
                "CCLE",
                {"id": "CCLE,gCSI", "set_active": false},
                {"id": "gCSI", "kind": "single"}
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(config, root()).unwrap();
    assert_eq!(
        resolved.db_path,
        Some(Utf8PathBuf::from("/data/droma.sqlite"))
    );
    assert_eq!(
        resolved.rscript,
        Some(PathBuf::from("/usr/local/bin/Rscript"))
    );
    assert_eq!(resolved.cache_max_age, Duration::from_secs(6 * 3600));
    assert_eq!(resolved.audit.mean_tolerance, 0.05);
    assert_eq!(resolved.exports_dir, root().join("exports"));

    assert_eq!(resolved.datasets.len(), 3);
    assert_eq!(resolved.datasets[0].kind, DatasetKind::Single);
    assert!(resolved.datasets[0].set_active);
    assert_eq!(resolved.datasets[1].kind, DatasetKind::Multi);
    assert!(!resolved.datasets[1].set_active);
    assert_eq!(resolved.datasets[2].id.as_str(), "gCSI");
}

#[test]
fn environment_overrides_file() {
    let config = Config {
        db_path: Some("/from/file.sqlite".to_string()),
        ..Config::default()
    };
    let config = ConfigLoader::apply_env(config, |name| match name {
        "DROMA_DB_PATH" => Some("/from/env.sqlite".to_string()),
        "R_LIBS" => Some(String::new()),
        _ => None,
    });
    assert_eq!(config.db_path.as_deref(), Some("/from/env.sqlite"));
    assert_eq!(config.r_libs, None);
}

#[test]
fn invalid_entries_are_rejected() {
    let config = Config {
        datasets: vec![DatasetEntry::Detailed(DatasetEntryObject {
            id: "bad id".to_string(),
            kind: None,
            set_active: None,
        })],
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config, root()),
        Err(DromaError::InvalidDatasetId(_))
    );

    let config = Config {
        audit: Some(AuditThresholds {
            mean_tolerance: 0.1,
            std_lower: 1.5,
            std_upper: 0.5,
        }),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config, root()),
        Err(DromaError::ConfigParse(_))
    );
}

#[test]
fn explicit_config_path_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("droma-broker.json");
    let err = ConfigLoader::resolve(missing.to_str()).unwrap_err();
    assert_matches!(err, DromaError::ConfigRead(_));

    let broken = temp.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    let err = ConfigLoader::resolve(broken.to_str()).unwrap_err();
    assert_matches!(err, DromaError::ConfigParse(_));
}
