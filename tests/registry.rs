use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use droma_broker::artifact::Artifact;
use droma_broker::bridge::{BridgeError, OperationParams, RuntimeBridge};
use droma_broker::domain::{DatasetId, DatasetKind, Operation, RuntimeRef};
use droma_broker::error::DromaError;
use droma_broker::registry::{DatasetRegistry, LoadOutcome, UnloadOutcome};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Materialize { id: String, source: String, runtime_ref: String },
    Release(String),
}

#[derive(Default)]
struct RecordingBridge {
    calls: Arc<Mutex<Vec<Call>>>,
    next: usize,
    fail_materialize: bool,
    fail_release: bool,
    unavailable: bool,
}

impl RecordingBridge {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl RuntimeBridge for RecordingBridge {
    type Raw = Artifact;

    fn materialize(
        &mut self,
        _kind: DatasetKind,
        id: &DatasetId,
        source: &Utf8Path,
    ) -> Result<RuntimeRef, BridgeError> {
        if self.unavailable {
            return Err(BridgeError::Unavailable);
        }
        if self.fail_materialize {
            return Err(BridgeError::Failure("project not in database".to_string()));
        }
        self.next += 1;
        let runtime_ref = format!("obj{}", self.next);
        self.calls.lock().unwrap().push(Call::Materialize {
            id: id.to_string(),
            source: source.to_string(),
            runtime_ref: runtime_ref.clone(),
        });
        Ok(RuntimeRef::new(runtime_ref))
    }

    fn release(&mut self, runtime_ref: &RuntimeRef) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Release(runtime_ref.to_string()));
        if self.fail_release {
            return Err(BridgeError::Failure("object already gone".to_string()));
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        _operation: Operation,
        _runtime_ref: &RuntimeRef,
        _params: &OperationParams,
    ) -> Result<Artifact, BridgeError> {
        Err(BridgeError::Failure("not used".to_string()))
    }

    fn to_canonical(&self, raw: Artifact) -> Artifact {
        raw
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    first_db: Utf8PathBuf,
    second_db: Utf8PathBuf,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let first_db = root.join("droma.sqlite");
    let second_db = root.join("droma-2.sqlite");
    std::fs::write(&first_db, b"").unwrap();
    std::fs::write(&second_db, b"").unwrap();
    Fixture {
        _temp: temp,
        first_db,
        second_db,
    }
}

fn id(value: &str) -> DatasetId {
    value.parse().unwrap()
}

#[test]
fn load_as_active_then_resolve_without_id() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    let outcome = registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    assert_eq!(outcome, LoadOutcome::Loaded);

    let handle = registry.resolve(None, DatasetKind::Single).unwrap();
    assert_eq!(handle.id, id("CCLE"));
    assert_eq!(handle.runtime_ref, RuntimeRef::new("obj1"));
    assert_eq!(handle.source, fixture.first_db);
    assert!(registry.resolve(None, DatasetKind::Multi).is_none());
}

#[test]
fn reload_releases_previous_object_before_materializing() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    let outcome = registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.second_db, false)
        .unwrap();
    assert_eq!(outcome, LoadOutcome::Replaced);

    assert_eq!(
        bridge.calls(),
        vec![
            Call::Materialize {
                id: "CCLE".to_string(),
                source: fixture.first_db.to_string(),
                runtime_ref: "obj1".to_string(),
            },
            Call::Release("obj1".to_string()),
            Call::Materialize {
                id: "CCLE".to_string(),
                source: fixture.second_db.to_string(),
                runtime_ref: "obj2".to_string(),
            },
        ]
    );

    let listing = registry.list();
    assert_eq!(listing.single_ids, vec!["CCLE".to_string()]);
    // The replaced handle was active, so the replacement is too.
    assert_eq!(listing.active_single.as_deref(), Some("CCLE"));
    let handle = registry.resolve(None, DatasetKind::Single).unwrap();
    assert_eq!(handle.runtime_ref, RuntimeRef::new("obj2"));
    assert_eq!(handle.source, fixture.second_db);
}

#[test]
fn unloading_active_clears_pointer_but_other_unloads_do_not() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    registry
        .load(&mut bridge, &id("gCSI"), DatasetKind::Single, &fixture.first_db, false)
        .unwrap();

    let outcome = registry
        .unload(&mut bridge, &id("gCSI"), DatasetKind::Single)
        .unwrap();
    assert_eq!(outcome, UnloadOutcome::Unloaded { released: true });
    assert!(registry.is_active(&id("CCLE"), DatasetKind::Single));

    registry
        .unload(&mut bridge, &id("CCLE"), DatasetKind::Single)
        .unwrap();
    assert!(registry.resolve(None, DatasetKind::Single).is_none());
    assert_eq!(registry.list().active_single, None);
    assert_eq!(
        bridge.calls()[2..].to_vec(),
        vec![
            Call::Release("obj2".to_string()),
            Call::Release("obj1".to_string())
        ]
    );
}

#[test]
fn unloading_unknown_dataset_is_a_warning_not_an_error() {
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();
    let outcome = registry
        .unload(&mut bridge, &id("CCLE"), DatasetKind::Single)
        .unwrap();
    assert_eq!(outcome, UnloadOutcome::NotLoaded);
    assert!(bridge.calls().is_empty());
}

#[test]
fn single_and_multi_handles_live_side_by_side() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    registry
        .load(&mut bridge, &id("CCLE,gCSI"), DatasetKind::Multi, &fixture.first_db, true)
        .unwrap();

    let listing = registry.list();
    assert_eq!(listing.single_ids, vec!["CCLE".to_string()]);
    assert_eq!(listing.multi_ids, vec!["CCLE,gCSI".to_string()]);
    assert_eq!(
        registry
            .resolve(None, DatasetKind::Multi)
            .unwrap()
            .runtime_ref,
        RuntimeRef::new("obj2")
    );
    assert!(registry.resolve(Some(&id("CCLE")), DatasetKind::Multi).is_none());
}

#[test]
fn load_validates_before_touching_the_runtime() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    let err = registry
        .load(&mut bridge, &id("CCLE,gCSI"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap_err();
    assert_matches!(err, DromaError::InvalidDatasetId(_));

    let missing = fixture.first_db.with_file_name("missing.sqlite");
    let err = registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &missing, true)
        .unwrap_err();
    assert_matches!(err, DromaError::SourceNotFound(_));
    assert!(bridge.calls().is_empty());
}

#[test]
fn runtime_failures_are_annotated_and_leave_no_handle() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();

    let mut failing = RecordingBridge {
        fail_materialize: true,
        ..RecordingBridge::default()
    };
    let err = registry
        .load(&mut failing, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap_err();
    assert_matches!(
        err,
        DromaError::RuntimeFailure { ref context, ref message }
            if context.contains("CCLE") && message == "project not in database"
    );

    let mut missing = RecordingBridge {
        unavailable: true,
        ..RecordingBridge::default()
    };
    let err = registry
        .load(&mut missing, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap_err();
    assert_matches!(err, DromaError::BridgeUnavailable);
    assert!(registry.list().single_ids.is_empty());
}

#[test]
fn set_active_requires_a_loaded_handle() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    let err = registry
        .set_active(&id("CCLE"), DatasetKind::Single)
        .unwrap_err();
    assert_matches!(err, DromaError::DatasetNotFound(_));

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, false)
        .unwrap();
    assert!(registry.resolve(None, DatasetKind::Single).is_none());
    registry.set_active(&id("CCLE"), DatasetKind::Single).unwrap();
    assert!(registry.resolve(None, DatasetKind::Single).is_some());
}

#[test]
fn drain_releases_everything() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge::default();

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    registry
        .load(&mut bridge, &id("CCLE,gCSI"), DatasetKind::Multi, &fixture.first_db, true)
        .unwrap();

    assert_eq!(registry.drain(&mut bridge), 2);
    let listing = registry.list();
    assert!(listing.single_ids.is_empty() && listing.multi_ids.is_empty());
    assert_eq!(listing.active_single, None);
    assert_eq!(
        bridge
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Release(_)))
            .count(),
        2
    );
}

#[test]
fn release_failures_are_logged_not_propagated() {
    let fixture = fixture();
    let registry = DatasetRegistry::new();
    let mut bridge = RecordingBridge {
        fail_release: true,
        ..RecordingBridge::default()
    };

    registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    let outcome = registry
        .load(&mut bridge, &id("CCLE"), DatasetKind::Single, &fixture.second_db, false)
        .unwrap();
    assert_eq!(outcome, LoadOutcome::Replaced);
    assert_eq!(
        registry
            .resolve(None, DatasetKind::Single)
            .unwrap()
            .runtime_ref,
        RuntimeRef::new("obj2")
    );

    let outcome = registry
        .unload(&mut bridge, &id("CCLE"), DatasetKind::Single)
        .unwrap();
    assert_eq!(outcome, UnloadOutcome::Unloaded { released: false });
    assert_eq!(registry.list().active_single, None);
    assert!(registry.list().single_ids.is_empty());

    registry
        .load(&mut bridge, &id("gCSI"), DatasetKind::Single, &fixture.first_db, true)
        .unwrap();
    registry
        .load(&mut bridge, &id("CCLE,gCSI"), DatasetKind::Multi, &fixture.first_db, true)
        .unwrap();
    assert_eq!(registry.drain(&mut bridge), 2);
    let listing = registry.list();
    assert!(listing.single_ids.is_empty() && listing.multi_ids.is_empty());
    assert_eq!(listing.active_multi, None);
}
