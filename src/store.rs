//! Transactional state store.
//!
//! `LabState` holds every table the pipeline needs. `LabStore` publishes one
//! committed `Arc<LabState>` at a time: readers clone the `Arc` and walk a
//! consistent snapshot without holding any lock, writers serialize on a mutex,
//! mutate a private copy and swap it in only when the whole unit succeeded.

use crate::{
    composition::Composition,
    container::Container,
    error::LabError,
    plate::{Plate, PlateConfiguration},
    process::Process,
    registry::Registry,
};
use labtrack_protocol::{
    CompositionId, ContainerId, ErrorCode, PlateConfigurationId, PlateId, ProcessId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    pub percentage_tolerance: f64,
    pub default_blank_volume: Option<f64>,
    pub sample_well_volume: f64,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            percentage_tolerance: 1e-5,
            default_blank_volume: None,
            sample_well_volume: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdCounters {
    pub container: u64,
    pub composition: u64,
    pub process: u64,
    pub plate: u64,
    pub plate_configuration: u64,
}

pub(crate) fn next_id(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabState {
    pub containers: BTreeMap<ContainerId, Container>,
    pub compositions: BTreeMap<CompositionId, Composition>,
    /// container -> the one composition it holds
    pub container_owner: BTreeMap<ContainerId, CompositionId>,
    pub processes: BTreeMap<ProcessId, Process>,
    pub plates: BTreeMap<PlateId, Plate>,
    pub plate_configurations: BTreeMap<PlateConfigurationId, PlateConfiguration>,
    pub registry: Registry,
    pub parameters: EngineParameters,
    pub counters: IdCounters,
}

impl LabState {
    pub fn load_from_path(path: &str) -> Result<Self, LabError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LabError::new(ErrorCode::Io, format!("Could not read state file '{path}': {e}"))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            LabError::validation("state", format!("Could not parse state JSON '{path}': {e}"))
        })
    }

    pub fn save_to_path(&self, path: &str) -> Result<(), LabError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            LabError::new(ErrorCode::Internal, format!("Could not serialize state: {e}"))
        })?;
        std::fs::write(path, text).map_err(|e| {
            LabError::new(ErrorCode::Io, format!("Could not write state file '{path}': {e}"))
        })
    }

    pub fn composition(&self, id: CompositionId) -> Result<&Composition, LabError> {
        self.compositions
            .get(&id)
            .ok_or_else(|| LabError::not_found("Composition", id))
    }

    pub fn container(&self, id: ContainerId) -> Result<&Container, LabError> {
        self.containers
            .get(&id)
            .ok_or_else(|| LabError::not_found("Container", id))
    }

    pub fn process(&self, id: ProcessId) -> Result<&Process, LabError> {
        self.processes
            .get(&id)
            .ok_or_else(|| LabError::not_found("Process", id))
    }

    pub fn plate(&self, id: PlateId) -> Result<&Plate, LabError> {
        self.plates
            .get(&id)
            .ok_or_else(|| LabError::not_found("Plate", id))
    }

    pub fn plate_configuration(
        &self,
        id: PlateConfigurationId,
    ) -> Result<&PlateConfiguration, LabError> {
        self.plate_configurations
            .get(&id)
            .ok_or_else(|| LabError::not_found("Plate configuration", id))
    }

    /// Storage constraints checked before a transaction is published.
    pub fn check_integrity(&self) -> Result<(), String> {
        for (id, container) in &self.containers {
            if !(container.remaining_volume >= 0.0) {
                return Err(format!(
                    "container {id} has remaining volume {}",
                    container.remaining_volume
                ));
            }
            if !self.container_owner.contains_key(id) {
                return Err(format!("container {id} is not owned by a composition"));
            }
        }
        for (container, owner) in &self.container_owner {
            match self.compositions.get(owner) {
                Some(comp) if comp.container == *container => {}
                _ => return Err(format!("container {container} owner {owner} mismatch")),
            }
        }
        for (id, comp) in &self.compositions {
            if !self.containers.contains_key(&comp.container) {
                return Err(format!(
                    "composition {id} refers to missing container {}",
                    comp.container
                ));
            }
            if !self.processes.contains_key(&comp.produced_by) {
                return Err(format!(
                    "composition {id} refers to missing process {}",
                    comp.produced_by
                ));
            }
            for edge in &comp.parents {
                let parent = self
                    .compositions
                    .get(&edge.parent)
                    .ok_or_else(|| format!("composition {id} has missing parent {}", edge.parent))?;
                if parent.produced_by >= comp.produced_by {
                    return Err(format!(
                        "composition {id} (process {}) has parent {} from process {}",
                        comp.produced_by, parent.id, parent.produced_by
                    ));
                }
            }
        }
        for (id, plate) in &self.plates {
            for container in plate.wells.values() {
                if !self.containers.contains_key(container) {
                    return Err(format!("plate {id} refers to missing container {container}"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LabStore {
    committed: RwLock<Arc<LabState>>,
    writer: Mutex<()>,
}

impl LabStore {
    pub fn new(state: LabState) -> Self {
        Self {
            committed: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        }
    }

    /// Consistent read view. Never blocks writers for longer than the `Arc` clone.
    pub fn snapshot(&self) -> Arc<LabState> {
        self.committed.read().clone()
    }

    /// Runs `f` against a private copy of the committed state. The copy is
    /// published only if `f` succeeds and the result passes the integrity
    /// check; any error leaves the committed state untouched.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, LabError>
    where
        F: FnOnce(&mut LabState) -> Result<T, LabError>,
    {
        let _guard = self.writer.lock();
        let mut staged = LabState::clone(&self.snapshot());
        let value = f(&mut staged)?;
        if let Err(detail) = staged.check_integrity() {
            log::error!("Integrity violation, transaction aborted: {detail}");
            return Err(LabError::integrity("Storage constraint violated; transaction aborted"));
        }
        *self.committed.write() = Arc::new(staged);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerKind;

    #[test]
    fn test_failed_transaction_leaves_state_untouched() {
        let store = LabStore::default();
        let err = store
            .transaction(|tx| {
                tx.parameters.sample_well_volume = 99.0;
                Err::<(), _>(LabError::state("abort"))
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::State);
        assert_eq!(store.snapshot().parameters.sample_well_volume, 10.0);
    }

    #[test]
    fn test_integrity_violation_is_generic() {
        let store = LabStore::default();
        let err = store
            .transaction(|tx| {
                // a container nobody owns
                tx.create_tube("orphan", 1.0);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Integrity);
        assert!(!err.message.contains("orphan"));
        assert!(store.snapshot().containers.is_empty());
    }

    #[test]
    fn test_snapshot_survives_later_commit() {
        let store = LabStore::default();
        let before = store.snapshot();
        store
            .transaction(|tx| {
                tx.parameters.percentage_tolerance = 1e-3;
                Ok(())
            })
            .unwrap();
        assert_eq!(before.parameters.percentage_tolerance, 1e-5);
        assert_eq!(store.snapshot().parameters.percentage_tolerance, 1e-3);
    }

    #[test]
    fn test_state_round_trips_through_file() {
        let mut state = LabState::default();
        state.parameters.default_blank_volume = Some(2.0);
        let container = state.create_tube("pool-1", 5.0);
        assert!(matches!(
            state.containers[&container].kind,
            ContainerKind::Tube { .. }
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let path = path.to_str().unwrap();
        state.save_to_path(path).unwrap();
        let loaded = LabState::load_from_path(path).unwrap();
        assert_eq!(loaded.parameters, state.parameters);
        assert_eq!(loaded.containers, state.containers);
    }
}
