use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::bridge::RuntimeBridge;
use crate::domain::{DatasetId, DatasetKind, RuntimeRef};
use crate::error::DromaError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetHandle {
    pub id: DatasetId,
    pub kind: DatasetKind,
    pub runtime_ref: RuntimeRef,
    pub source: Utf8PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnloadOutcome {
    Unloaded { released: bool },
    NotLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryListing {
    pub single_ids: Vec<String>,
    pub multi_ids: Vec<String>,
    pub active_single: Option<String>,
    pub active_multi: Option<String>,
}

#[derive(Debug, Default)]
struct HandleTable {
    handles: HashMap<DatasetId, DatasetHandle>,
    order: Vec<DatasetId>,
    active: Option<DatasetId>,
}

impl HandleTable {
    fn insert(&mut self, handle: DatasetHandle) {
        if !self.handles.contains_key(&handle.id) {
            self.order.push(handle.id.clone());
        }
        self.handles.insert(handle.id.clone(), handle);
    }

    fn remove(&mut self, id: &DatasetId) -> Option<DatasetHandle> {
        let handle = self.handles.remove(id)?;
        self.order.retain(|existing| existing != id);
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
        Some(handle)
    }

    fn ids(&self) -> Vec<String> {
        self.order.iter().map(|id| id.as_str().to_string()).collect()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    single: HandleTable,
    multi: HandleTable,
}

impl RegistryState {
    fn table(&self, kind: DatasetKind) -> &HandleTable {
        match kind {
            DatasetKind::Single => &self.single,
            DatasetKind::Multi => &self.multi,
        }
    }

    fn table_mut(&mut self, kind: DatasetKind) -> &mut HandleTable {
        match kind {
            DatasetKind::Single => &mut self.single,
            DatasetKind::Multi => &mut self.multi,
        }
    }
}

/// Lookups only take the read side of the lock. Methods that talk to the
/// runtime take the bridge as `&mut`, so they can only run inside the
/// caller's bridge critical section.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    state: RwLock<RegistryState>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<B: RuntimeBridge + ?Sized>(
        &self,
        bridge: &mut B,
        id: &DatasetId,
        kind: DatasetKind,
        source: &Utf8Path,
        set_active: bool,
    ) -> Result<LoadOutcome, DromaError> {
        if !id.fits(kind) {
            return Err(DromaError::InvalidDatasetId(format!(
                "{id} names several projects; load it as a multi dataset"
            )));
        }
        if !source.as_std_path().exists() {
            return Err(DromaError::SourceNotFound(source.to_string()));
        }

        // The old runtime object goes away before the new one is created.
        let previous = {
            let mut state = self.write()?;
            let table = state.table_mut(kind);
            let was_active = table.active.as_ref() == Some(id);
            table.remove(id).map(|handle| (handle, was_active))
        };
        let outcome = match &previous {
            Some((handle, _)) => {
                release_quietly(bridge, handle);
                LoadOutcome::Replaced
            }
            None => LoadOutcome::Loaded,
        };

        let runtime_ref = bridge
            .materialize(kind, id, source)
            .map_err(|err| err.annotate(format!("failed to load dataset {id}")))?;
        let handle = DatasetHandle {
            id: id.clone(),
            kind,
            runtime_ref,
            source: source.to_path_buf(),
            loaded_at: Utc::now(),
        };

        let keep_active = previous.is_some_and(|(_, was_active)| was_active);
        match self.state.write() {
            Ok(mut state) => {
                let table = state.table_mut(kind);
                table.insert(handle);
                if set_active || keep_active {
                    table.active = Some(id.clone());
                }
            }
            Err(_) => {
                // Nothing local references the new object; hand it back.
                release_quietly(bridge, &handle);
                return Err(DromaError::StatePoisoned("dataset registry".to_string()));
            }
        }
        info!(dataset = %id, %kind, ?outcome, active = set_active || keep_active, "dataset loaded");
        Ok(outcome)
    }

    pub fn resolve(&self, id: Option<&DatasetId>, kind: DatasetKind) -> Option<DatasetHandle> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let table = state.table(kind);
        let id = id.or(table.active.as_ref())?;
        table.handles.get(id).cloned()
    }

    pub fn set_active(&self, id: &DatasetId, kind: DatasetKind) -> Result<(), DromaError> {
        let mut state = self.write()?;
        let table = state.table_mut(kind);
        if !table.handles.contains_key(id) {
            return Err(DromaError::DatasetNotFound(format!("{} {id}", kind.label())));
        }
        table.active = Some(id.clone());
        info!(dataset = %id, %kind, "active dataset changed");
        Ok(())
    }

    pub fn unload<B: RuntimeBridge + ?Sized>(
        &self,
        bridge: &mut B,
        id: &DatasetId,
        kind: DatasetKind,
    ) -> Result<UnloadOutcome, DromaError> {
        let removed = self.write()?.table_mut(kind).remove(id);
        let Some(handle) = removed else {
            warn!(dataset = %id, %kind, "unload requested for a dataset that is not loaded");
            return Ok(UnloadOutcome::NotLoaded);
        };
        let released = release_quietly(bridge, &handle);
        info!(dataset = %id, %kind, released, "dataset unloaded");
        Ok(UnloadOutcome::Unloaded { released })
    }

    pub fn list(&self) -> RegistryListing {
        let state = self.read();
        RegistryListing {
            single_ids: state.single.ids(),
            multi_ids: state.multi.ids(),
            active_single: state.single.active.as_ref().map(|id| id.to_string()),
            active_multi: state.multi.active.as_ref().map(|id| id.to_string()),
        }
    }

    pub fn handles(&self, kind: DatasetKind) -> Vec<DatasetHandle> {
        let state = self.read();
        let table = state.table(kind);
        table
            .order
            .iter()
            .filter_map(|id| table.handles.get(id).cloned())
            .collect()
    }

    pub fn is_active(&self, id: &DatasetId, kind: DatasetKind) -> bool {
        self.read().table(kind).active.as_ref() == Some(id)
    }

    pub fn drain<B: RuntimeBridge + ?Sized>(&self, bridge: &mut B) -> usize {
        let handles: Vec<DatasetHandle> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut drained = Vec::new();
            for kind in [DatasetKind::Single, DatasetKind::Multi] {
                let table = std::mem::take(state.table_mut(kind));
                let HandleTable {
                    mut handles, order, ..
                } = table;
                drained.extend(order.iter().filter_map(|id| handles.remove(id)));
            }
            drained
        };
        for handle in &handles {
            release_quietly(bridge, handle);
        }
        handles.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, DromaError> {
        self.state
            .write()
            .map_err(|_| DromaError::StatePoisoned("dataset registry".to_string()))
    }
}

fn release_quietly<B: RuntimeBridge + ?Sized>(bridge: &mut B, handle: &DatasetHandle) -> bool {
    match bridge.release(&handle.runtime_ref) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                dataset = %handle.id,
                runtime_ref = %handle.runtime_ref,
                error = %err,
                "failed to release runtime object"
            );
            false
        }
    }
}
