//! Flat CSV view of the provenance DAG, one row per edge.

use crate::{error::LabError, store::LabState};
use labtrack_protocol::{CompositionId, ProcessId};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdgeRow {
    pub child: CompositionId,
    pub child_kind: String,
    pub child_location: String,
    pub parent: CompositionId,
    pub parent_kind: String,
    pub volume_consumed: f64,
    pub fraction_of_output: f64,
    pub process: ProcessId,
    pub process_kind: String,
    pub timestamp: String,
}

fn location(state: &LabState, composition: CompositionId) -> Result<String, LabError> {
    let container = state.container(state.composition(composition)?.container)?;
    Ok(match container.well_position() {
        Some((plate, position)) => format!("{}:{position}", state.plate(plate)?.name),
        None => container.external_id().unwrap_or_default().to_string(),
    })
}

fn edge_rows(
    state: &LabState,
    composition: CompositionId,
    rows: &mut Vec<LineageEdgeRow>,
) -> Result<(), LabError> {
    let child = state.composition(composition)?;
    let process = state.process(child.produced_by)?;
    for edge in &child.parents {
        rows.push(LineageEdgeRow {
            child: child.id,
            child_kind: child.kind.name().to_string(),
            child_location: location(state, child.id)?,
            parent: edge.parent,
            parent_kind: state.composition(edge.parent)?.kind.name().to_string(),
            volume_consumed: edge.volume_consumed,
            fraction_of_output: edge.fraction_of_output,
            process: process.id,
            process_kind: process.kind_name().to_string(),
            timestamp: process.timestamp.to_rfc3339(),
        });
    }
    Ok(())
}

/// Every edge in the store, ordered by child id.
pub fn lineage_rows(state: &LabState) -> Result<Vec<LineageEdgeRow>, LabError> {
    let mut rows = Vec::new();
    for id in state.compositions.keys() {
        edge_rows(state, *id, &mut rows)?;
    }
    Ok(rows)
}

/// Edges reachable from one composition, the composition's own edges first.
pub fn lineage_rows_for(
    state: &LabState,
    composition: CompositionId,
) -> Result<Vec<LineageEdgeRow>, LabError> {
    let mut rows = Vec::new();
    edge_rows(state, composition, &mut rows)?;
    for ancestor in state.trace_lineage(composition)? {
        edge_rows(state, ancestor.id, &mut rows)?;
    }
    Ok(rows)
}

pub fn write_lineage_csv<W: Write>(rows: &[LineageEdgeRow], out: W) -> Result<(), LabError> {
    let mut writer = csv::Writer::from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn export_lineage_csv(state: &LabState, path: &str) -> Result<usize, LabError> {
    let rows = lineage_rows(state)?;
    let file = std::fs::File::create(path).map_err(|e| {
        LabError::new(
            labtrack_protocol::ErrorCode::Io,
            format!("Could not create '{path}': {e}"),
        )
    })?;
    write_lineage_csv(&rows, file)?;
    Ok(rows.len())
}
