//! The provenance DAG.
//!
//! Every composition records the process that produced it and weighted edges
//! to the compositions it was made from. Parents always come from a process
//! with a strictly smaller id, so walking edges can never loop.

use crate::{
    error::LabError,
    store::{next_id, LabState},
};
use labtrack_protocol::{CompositionId, ContainerId, ProcessId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OligoRole {
    Primer,
    I5Adapter,
    I7Adapter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompositionKind {
    Sample {
        content: String,
        blank: bool,
    },
    Oligo {
        role: OligoRole,
        name: String,
        sequence: String,
    },
    Gdna,
    CompressedGdna,
    AmpliconLibrary,
    Normalized {
        dna_volume: f64,
        water_volume: f64,
    },
    ShotgunLibrary,
    Pool {
        name: String,
    },
}

impl CompositionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sample { .. } => "sample",
            Self::Oligo { .. } => "oligo",
            Self::Gdna => "gDNA",
            Self::CompressedGdna => "compressed gDNA",
            Self::AmpliconLibrary => "amplicon library",
            Self::Normalized { .. } => "normalized gDNA",
            Self::ShotgunLibrary => "shotgun library",
            Self::Pool { .. } => "pool",
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Sample { blank: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    pub parent: CompositionId,
    pub volume_consumed: f64,
    pub fraction_of_output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub id: CompositionId,
    pub container: ContainerId,
    pub kind: CompositionKind,
    pub produced_by: ProcessId,
    pub concentration: Option<f64>,
    pub parents: Vec<ProvenanceEdge>,
}

impl Composition {
    pub fn fraction_from(&self, parent: CompositionId) -> Option<f64> {
        self.parents
            .iter()
            .filter(|e| e.parent == parent)
            .map(|e| e.fraction_of_output)
            .reduce(|a, b| a + b)
    }
}

/// Ancestors of one composition, most recent producing process first.
///
/// Holds only a borrowed snapshot and its own frontier, so any number of
/// walks can run side by side and calling `trace_lineage` again restarts.
#[derive(Debug, Clone)]
pub struct Lineage<'a> {
    state: &'a LabState,
    frontier: BinaryHeap<(ProcessId, CompositionId)>,
    seen: BTreeSet<CompositionId>,
}

impl<'a> Lineage<'a> {
    fn push_parents(&mut self, composition: &Composition) {
        for edge in &composition.parents {
            if !self.seen.insert(edge.parent) {
                continue;
            }
            if let Some(parent) = self.state.compositions.get(&edge.parent) {
                self.frontier.push((parent.produced_by, parent.id));
            }
        }
    }
}

impl<'a> Iterator for Lineage<'a> {
    type Item = &'a Composition;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, id) = self.frontier.pop()?;
        let state = self.state;
        let composition = state.compositions.get(&id)?;
        self.push_parents(composition);
        Some(composition)
    }
}

impl LabState {
    pub(crate) fn add_composition(
        &mut self,
        container: ContainerId,
        kind: CompositionKind,
        produced_by: ProcessId,
        parents: Vec<ProvenanceEdge>,
    ) -> Result<CompositionId, LabError> {
        if let Some(owner) = self.container_owner.get(&container) {
            return Err(LabError::state(format!(
                "Container {container} already holds composition {owner}"
            )));
        }
        let id = next_id(&mut self.counters.composition);
        self.compositions.insert(
            id,
            Composition {
                id,
                container,
                kind,
                produced_by,
                concentration: None,
                parents,
            },
        );
        self.container_owner.insert(container, id);
        Ok(id)
    }

    /// Composition held by a container, if any.
    pub fn composition_in(&self, container: ContainerId) -> Option<&Composition> {
        self.container_owner
            .get(&container)
            .and_then(|id| self.compositions.get(id))
    }

    pub fn trace_lineage(&self, composition: CompositionId) -> Result<Lineage<'_>, LabError> {
        let root = self.composition(composition)?;
        let mut lineage = Lineage {
            state: self,
            frontier: BinaryHeap::new(),
            seen: BTreeSet::from([composition]),
        };
        lineage.push_parents(root);
        Ok(lineage)
    }

    /// Sum, over every path from `composition` down to `ancestor`, of the
    /// volume drawn directly from `ancestor` on that path.
    pub fn volume_attributed_to(
        &self,
        composition: CompositionId,
        ancestor: CompositionId,
    ) -> Result<f64, LabError> {
        self.composition(ancestor)?;
        let mut memo: HashMap<CompositionId, f64> = HashMap::new();
        self.attributed(composition, ancestor, &mut memo)
    }

    fn attributed(
        &self,
        composition: CompositionId,
        ancestor: CompositionId,
        memo: &mut HashMap<CompositionId, f64>,
    ) -> Result<f64, LabError> {
        if let Some(v) = memo.get(&composition) {
            return Ok(*v);
        }
        let node = self.composition(composition)?;
        let mut total = 0.0;
        for edge in &node.parents {
            if edge.parent == ancestor {
                total += edge.volume_consumed;
            } else {
                total += self.attributed(edge.parent, ancestor, memo)?;
            }
        }
        memo.insert(composition, total);
        Ok(total)
    }

    /// Most recent ancestor (or the composition itself) matching `pred`.
    pub fn find_in_lineage<F>(
        &self,
        composition: CompositionId,
        pred: F,
    ) -> Result<Option<&Composition>, LabError>
    where
        F: Fn(&Composition) -> bool,
    {
        let start = self.composition(composition)?;
        if pred(start) {
            return Ok(Some(start));
        }
        Ok(self.trace_lineage(composition)?.find(|c| pred(c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Process, ProcessDetails};
    use chrono::Utc;

    fn edge(parent: CompositionId, volume: f64, fraction: f64) -> ProvenanceEdge {
        ProvenanceEdge {
            parent,
            volume_consumed: volume,
            fraction_of_output: fraction,
        }
    }

    /// Builds a diamond: s1 -> g1, s1 -> g2, (g1, g2) -> pool.
    fn diamond() -> (LabState, [CompositionId; 4]) {
        let mut state = LabState::default();
        for id in 1..=3 {
            state.processes.insert(
                id,
                Process {
                    id,
                    timestamp: Utc::now(),
                    operator: 1,
                    details: ProcessDetails::Quantification {
                        measurements: vec![],
                    },
                    consumed: vec![],
                    produced: vec![],
                    equipment: vec![],
                    reagents: vec![],
                },
            );
        }
        let mut add = |process: ProcessId, kind: CompositionKind, parents: Vec<ProvenanceEdge>| {
            let container = state.create_tube("t", 1.0);
            state
                .add_composition(container, kind, process, parents)
                .unwrap()
        };
        let s1 = add(
            1,
            CompositionKind::Sample {
                content: "1.SKB1".to_string(),
                blank: false,
            },
            vec![],
        );
        let g1 = add(2, CompositionKind::Gdna, vec![edge(s1, 2.0, 1.0)]);
        let g2 = add(2, CompositionKind::Gdna, vec![edge(s1, 3.0, 1.0)]);
        let pool = add(
            3,
            CompositionKind::Pool {
                name: "p".to_string(),
            },
            vec![edge(g1, 1.0, 0.5), edge(g2, 1.0, 0.5)],
        );
        (state, [s1, g1, g2, pool])
    }

    #[test]
    fn test_trace_lineage_most_recent_first() {
        let (state, [s1, g1, g2, pool]) = diamond();
        let ids: Vec<_> = state.trace_lineage(pool).unwrap().map(|c| c.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], s1);
        assert!(ids[..2].contains(&g1) && ids[..2].contains(&g2));
    }

    #[test]
    fn test_trace_lineage_is_restartable() {
        let (state, [_, _, _, pool]) = diamond();
        let mut first = state.trace_lineage(pool).unwrap();
        first.next();
        let a: Vec<_> = state.trace_lineage(pool).unwrap().map(|c| c.id).collect();
        let b: Vec<_> = state.trace_lineage(pool).unwrap().map(|c| c.id).collect();
        assert_eq!(a, b);
        assert_eq!(first.count(), 2);
    }

    #[test]
    fn test_volume_attributed_sums_paths() {
        let (state, [s1, g1, _, pool]) = diamond();
        assert_eq!(state.volume_attributed_to(pool, s1).unwrap(), 5.0);
        assert_eq!(state.volume_attributed_to(pool, g1).unwrap(), 1.0);
        assert_eq!(state.volume_attributed_to(s1, pool).unwrap(), 0.0);
    }

    #[test]
    fn test_find_in_lineage() {
        let (state, [s1, _, _, pool]) = diamond();
        let found = state
            .find_in_lineage(pool, |c| matches!(c.kind, CompositionKind::Sample { .. }))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, s1);
        assert_eq!(state.composition(pool).unwrap().fraction_from(s1), None);
    }

    #[test]
    fn test_container_holds_one_composition() {
        let (mut state, [s1, ..]) = diamond();
        let container = state.compositions[&s1].container;
        let err = state
            .add_composition(container, CompositionKind::Gdna, 3, vec![])
            .unwrap_err();
        assert_eq!(err.code, labtrack_protocol::ErrorCode::State);
    }
}
