//! Physical holding units: wells on plates and standalone tubes.

use crate::{
    error::LabError,
    plate::WellPosition,
    process::Process,
    store::{next_id, LabState},
};
use labtrack_protocol::{ContainerId, PlateId};
use serde::{Deserialize, Serialize};

/// Volumes below this are treated as rounding noise when drawing.
pub const VOLUME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContainerKind {
    Well {
        plate: PlateId,
        position: WellPosition,
    },
    Tube {
        external_id: String,
        discarded: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub kind: ContainerKind,
    pub remaining_volume: f64,
    pub notes: Option<String>,
}

impl Container {
    pub fn is_discarded(&self) -> bool {
        matches!(
            self.kind,
            ContainerKind::Tube {
                discarded: true,
                ..
            }
        )
    }

    pub fn well_position(&self) -> Option<(PlateId, WellPosition)> {
        match &self.kind {
            ContainerKind::Well { plate, position } => Some((*plate, *position)),
            ContainerKind::Tube { .. } => None,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match &self.kind {
            ContainerKind::Tube { external_id, .. } => Some(external_id),
            ContainerKind::Well { .. } => None,
        }
    }

    /// Decrements the remaining volume, or fails without touching it.
    pub fn consume(&mut self, amount: f64) -> Result<(), LabError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LabError::validation(
                "volume",
                format!("Cannot draw {amount} µL from container {}", self.id),
            ));
        }
        if amount > self.remaining_volume + VOLUME_EPSILON {
            return Err(LabError::insufficient_volume(
                self.id,
                amount,
                self.remaining_volume,
            ));
        }
        self.remaining_volume = (self.remaining_volume - amount).max(0.0);
        Ok(())
    }
}

impl LabState {
    /// New well container. The caller places it on the plate and wraps it in
    /// a composition within the same transaction.
    pub fn create_well(
        &mut self,
        plate: PlateId,
        position: WellPosition,
        volume: f64,
    ) -> Result<ContainerId, LabError> {
        let id = next_id(&mut self.counters.container);
        self.plates
            .get_mut(&plate)
            .ok_or_else(|| LabError::not_found("Plate", plate))?
            .set_well(position, id)?;
        self.containers.insert(
            id,
            Container {
                id,
                kind: ContainerKind::Well { plate, position },
                remaining_volume: volume,
                notes: None,
            },
        );
        Ok(id)
    }

    pub fn create_tube(&mut self, external_id: &str, volume: f64) -> ContainerId {
        let id = next_id(&mut self.counters.container);
        self.containers.insert(
            id,
            Container {
                id,
                kind: ContainerKind::Tube {
                    external_id: external_id.to_string(),
                    discarded: false,
                },
                remaining_volume: volume,
                notes: None,
            },
        );
        id
    }

    pub fn consume_volume(&mut self, container: ContainerId, amount: f64) -> Result<(), LabError> {
        let entry = self
            .containers
            .get_mut(&container)
            .ok_or_else(|| LabError::not_found("Container", container))?;
        entry.consume(amount)?;
        log::debug!(
            "Drew {amount} µL from container {container}, {} µL left",
            entry.remaining_volume
        );
        Ok(())
    }

    /// Marks a tube discarded. Discarding twice is a no-op.
    pub fn discard_tube(&mut self, container: ContainerId) -> Result<bool, LabError> {
        let entry = self
            .containers
            .get_mut(&container)
            .ok_or_else(|| LabError::not_found("Container", container))?;
        match &mut entry.kind {
            ContainerKind::Tube { discarded, .. } => {
                let changed = !*discarded;
                *discarded = true;
                Ok(changed)
            }
            ContainerKind::Well { .. } => Err(LabError::validation(
                "container",
                format!("Container {container} is a well; only tubes can be discarded"),
            )),
        }
    }

    pub fn set_container_notes(
        &mut self,
        container: ContainerId,
        notes: Option<String>,
    ) -> Result<(), LabError> {
        self.containers
            .get_mut(&container)
            .ok_or_else(|| LabError::not_found("Container", container))?
            .notes = notes;
        Ok(())
    }

    /// Most recent process (by id) that produced or consumed what this
    /// container holds. Recomputed on every call.
    pub fn latest_process(&self, container: ContainerId) -> Result<Option<&Process>, LabError> {
        self.container(container)?;
        let Some(composition) = self.container_owner.get(&container) else {
            return Ok(None);
        };
        Ok(self
            .processes
            .values()
            .rev()
            .find(|p| p.produced.contains(composition) || p.consumed.contains(composition)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrack_protocol::ErrorCode;

    fn tube(volume: f64) -> Container {
        Container {
            id: 1,
            kind: ContainerKind::Tube {
                external_id: "t".to_string(),
                discarded: false,
            },
            remaining_volume: volume,
            notes: None,
        }
    }

    #[test]
    fn test_overdraw_fails_and_keeps_volume() {
        let mut c = tube(100.0);
        let err = c.consume(150.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientVolume);
        assert_eq!(c.remaining_volume, 100.0);
        c.consume(40.0).unwrap();
        assert_eq!(c.remaining_volume, 60.0);
    }

    #[test]
    fn test_negative_draw_is_rejected() {
        let mut c = tube(1.0);
        assert_eq!(c.consume(-1.0).unwrap_err().code, ErrorCode::Validation);
        assert_eq!(c.consume(f64::NAN).unwrap_err().code, ErrorCode::Validation);
    }

    #[test]
    fn test_draw_everything_within_epsilon() {
        let mut c = tube(60.0 / 9.0 * 9.0);
        for _ in 0..9 {
            c.consume(60.0 / 9.0).unwrap();
        }
        assert!(c.remaining_volume >= 0.0);
        assert!(c.remaining_volume < 1e-9);
    }

    #[test]
    fn test_discard_is_idempotent() {
        let mut state = LabState::default();
        let id = state.create_tube("pool", 3.0);
        assert!(state.discard_tube(id).unwrap());
        assert!(!state.discard_tube(id).unwrap());
        assert!(state.containers[&id].is_discarded());
    }

    #[test]
    fn test_notes_set_and_cleared() {
        let mut state = LabState::default();
        let id = state.create_tube("pool", 3.0);
        state
            .set_container_notes(id, Some("thawed twice".to_string()))
            .unwrap();
        assert_eq!(state.containers[&id].notes.as_deref(), Some("thawed twice"));
        state.set_container_notes(id, None).unwrap();
        assert_eq!(state.containers[&id].notes, None);
        assert_eq!(
            state.set_container_notes(99, None).unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_unknown_container() {
        let mut state = LabState::default();
        assert_eq!(
            state.consume_volume(42, 1.0).unwrap_err().code,
            ErrorCode::NotFound
        );
        assert_eq!(state.latest_process(42).unwrap_err().code, ErrorCode::NotFound);
    }
}
