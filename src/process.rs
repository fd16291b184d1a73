//! Immutable process records.
//!
//! A process is written once, in the same transaction as the compositions it
//! produces, and never edited afterwards. `ProcessDetails` carries the typed
//! payload of each step; consumers match on it exhaustively.

use crate::{composition::OligoRole, pooling::PoolingFunction};
use chrono::{DateTime, Utc};
use labtrack_protocol::{
    CompositionId, EquipmentId, PlateId, ProcessId, ReagentId, UserId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub composition: CompositionId,
    pub concentration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolComponent {
    pub composition: CompositionId,
    pub input_volume: f64,
    pub percentage_of_output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingRun {
    pub run_name: String,
    pub description: Option<String>,
    pub platform: EquipmentId,
    pub fwd_cycles: u32,
    pub rev_cycles: u32,
    pub principal_investigator: UserId,
    pub contacts: Vec<UserId>,
    pub pools: Vec<CompositionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessDetails {
    SamplePlating {
        plate: PlateId,
    },
    OligoPlatePreparation {
        plate: PlateId,
        role: OligoRole,
    },
    GdnaExtraction {
        sample_plate: PlateId,
        plate: PlateId,
        extractor: EquipmentId,
        liquid_handler: EquipmentId,
        tool: EquipmentId,
        extraction_kit: ReagentId,
        volume: f64,
    },
    PlateCompression {
        sources: Vec<PlateId>,
        plate: PlateId,
        robot: EquipmentId,
    },
    LibraryPrep16S {
        gdna_plate: PlateId,
        primer_plate: PlateId,
        plate: PlateId,
        liquid_handler: EquipmentId,
        tools: Vec<EquipmentId>,
        master_mix: ReagentId,
        water: ReagentId,
        volume: f64,
        template_volume: f64,
        primer_volume: f64,
    },
    LibraryPrepShotgun {
        normalized_plate: PlateId,
        plate: PlateId,
        kappa_hyper_plus_kit: ReagentId,
        stub_lot: ReagentId,
        target_dna_ng: f64,
        i5_plate: PlateId,
        i7_plate: PlateId,
        adapter_volume: f64,
    },
    Normalization {
        quantification: ProcessId,
        plate: PlateId,
        water: ReagentId,
        total_volume: f64,
        target_concentration: f64,
    },
    Quantification {
        measurements: Vec<Measurement>,
    },
    Pooling {
        /// Source of the concentrations the pooling function saw.
        quantification: Option<ProcessId>,
        pool_name: String,
        pool: CompositionId,
        components: Vec<PoolComponent>,
        function: PoolingFunction,
        robot: Option<EquipmentId>,
    },
    Sequencing {
        run: SequencingRun,
    },
}

impl ProcessDetails {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SamplePlating { .. } => "SamplePlating",
            Self::OligoPlatePreparation { .. } => "OligoPlatePreparation",
            Self::GdnaExtraction { .. } => "GdnaExtraction",
            Self::PlateCompression { .. } => "PlateCompression",
            Self::LibraryPrep16S { .. } => "LibraryPrep16S",
            Self::LibraryPrepShotgun { .. } => "LibraryPrepShotgun",
            Self::Normalization { .. } => "Normalization",
            Self::Quantification { .. } => "Quantification",
            Self::Pooling { .. } => "Pooling",
            Self::Sequencing { .. } => "Sequencing",
        }
    }

    /// Plate created by this step, if it creates one.
    pub fn output_plate(&self) -> Option<PlateId> {
        match self {
            Self::SamplePlating { plate }
            | Self::OligoPlatePreparation { plate, .. }
            | Self::GdnaExtraction { plate, .. }
            | Self::PlateCompression { plate, .. }
            | Self::LibraryPrep16S { plate, .. }
            | Self::LibraryPrepShotgun { plate, .. }
            | Self::Normalization { plate, .. } => Some(*plate),
            Self::Quantification { .. } | Self::Pooling { .. } | Self::Sequencing { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub timestamp: DateTime<Utc>,
    pub operator: UserId,
    pub details: ProcessDetails,
    /// Input compositions in request order. Volumes drawn are on the
    /// provenance edges of `produced`.
    pub consumed: Vec<CompositionId>,
    /// Compositions created, in creation order.
    pub produced: Vec<CompositionId>,
    pub equipment: Vec<EquipmentId>,
    pub reagents: Vec<ReagentId>,
}

impl Process {
    pub fn kind_name(&self) -> &'static str {
        self.details.kind_name()
    }

    pub fn sequencing_run(&self) -> Option<&SequencingRun> {
        match &self.details {
            ProcessDetails::Sequencing { run } => Some(run),
            _ => None,
        }
    }
}
