//! The process pipeline.
//!
//! Front ends describe every change as an `Operation`. `LabEngine` runs each
//! operation as one transaction against the `LabStore` and journals the ones
//! that commit. Results come back as plain `OpResult` data.

use crate::{
    composition::{Composition, CompositionKind, OligoRole, ProvenanceEdge},
    container::VOLUME_EPSILON,
    error::LabError,
    plate::WellPosition,
    pooling::{PoolingFunction, PoolingInput, PoolingPolicy},
    process::{Measurement, PoolComponent, Process, ProcessDetails, SequencingRun},
    sample_sheet::{check_sheet_field, detect_assay},
    store::{next_id, LabState, LabStore},
};
use chrono::{DateTime, Utc};
use labtrack_protocol::{
    Capabilities, CompositionId, ContainerId, EquipmentId, EquipmentTypeId, ErrorCode, OpId,
    PlateConfigurationId, PlateId, ProcessId, ReagentId, ReagentTypeId, RunId, UserId,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Sample identifier that marks a well as a blank.
pub const BLANK_SAMPLE_ID: &str = "blank";
pub const DEFAULT_TEMPLATE_VOLUME: f64 = 1.0;
pub const DEFAULT_PRIMER_VOLUME: f64 = 1.0;
pub const DEFAULT_ADAPTER_VOLUME: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatedSample {
    pub row: u32,
    pub col: u32,
    pub sample_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OligoWell {
    pub row: u32,
    pub col: u32,
    pub name: String,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantificationTarget {
    /// One concentration per plate position; empty positions are ignored.
    Plate {
        plate: PlateId,
        concentrations: Vec<Vec<f64>>,
    },
    Compositions {
        measurements: Vec<Measurement>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    CreateEquipmentType {
        description: String,
    },
    CreateEquipment {
        external_id: String,
        equipment_type: EquipmentTypeId,
        notes: Option<String>,
    },
    SetEquipmentNotes {
        equipment: EquipmentId,
        notes: Option<String>,
    },
    CreateReagentType {
        description: String,
    },
    CreateReagent {
        external_lot_id: String,
        reagent_type: ReagentTypeId,
        notes: Option<String>,
    },
    SetReagentNotes {
        reagent: ReagentId,
        notes: Option<String>,
    },
    CreateUser {
        name: String,
        email: String,
    },
    CreatePlateConfiguration {
        description: String,
        num_rows: u32,
        num_columns: u32,
    },
    SetContainerNotes {
        container: ContainerId,
        notes: Option<String>,
    },
    DiscardTube {
        container: ContainerId,
    },
    SetParameter {
        name: String,
        value: serde_json::Value,
    },
    PlateSamples {
        plate_name: String,
        configuration: PlateConfigurationId,
        samples: Vec<PlatedSample>,
    },
    PrepareOligoPlate {
        plate_name: String,
        configuration: PlateConfigurationId,
        role: OligoRole,
        volume: f64,
        oligos: Vec<OligoWell>,
    },
    ExtractGdna {
        sample_plate: PlateId,
        plate_name: String,
        extractor: EquipmentId,
        liquid_handler: EquipmentId,
        tool: EquipmentId,
        extraction_kit: ReagentId,
        volume: f64,
    },
    CompressPlates {
        sources: Vec<PlateId>,
        plate_name: String,
        robot: EquipmentId,
    },
    PrepareAmpliconLibrary {
        gdna_plate: PlateId,
        primer_plate: PlateId,
        plate_name: String,
        liquid_handler: EquipmentId,
        tools: Vec<EquipmentId>,
        master_mix: ReagentId,
        water: ReagentId,
        volume: f64,
        template_volume: Option<f64>,
        primer_volume: Option<f64>,
    },
    Normalize {
        quantification: ProcessId,
        plate_name: String,
        water: ReagentId,
        total_volume: f64,
        target_concentration: f64,
    },
    PrepareShotgunLibrary {
        normalized_plate: PlateId,
        plate_name: String,
        kappa_hyper_plus_kit: ReagentId,
        stub_lot: ReagentId,
        target_dna_ng: f64,
        i5_plate: PlateId,
        i7_plate: PlateId,
        adapter_volume: Option<f64>,
    },
    Quantify {
        target: QuantificationTarget,
    },
    Pool {
        quantification: Option<ProcessId>,
        pool_name: String,
        components: Vec<PoolComponent>,
        function: PoolingFunction,
        robot: Option<EquipmentId>,
    },
    Sequence {
        run_name: String,
        description: Option<String>,
        platform: EquipmentId,
        fwd_cycles: u32,
        rev_cycles: u32,
        principal_investigator: UserId,
        contacts: Vec<UserId>,
        pools: Vec<CompositionId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub run_id: RunId,
    pub operator: UserId,
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub op_id: OpId,
    pub process_id: Option<ProcessId>,
    pub created_plate: Option<PlateId>,
    pub created_compositions: Vec<CompositionId>,
    /// Id of a registry record or plate configuration created by the operation.
    pub created_id: Option<u64>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

impl OpResult {
    fn new(op_id: &str) -> Self {
        Self {
            op_id: op_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub run_id: RunId,
    pub operator: UserId,
    pub op: Operation,
    pub result: OpResult,
}

pub trait Engine {
    fn apply(&self, operator: UserId, op: Operation) -> Result<OpResult, LabError>;
    fn apply_workflow(&self, wf: Workflow) -> Result<Vec<OpResult>, LabError>;
    fn snapshot(&self) -> Arc<LabState>;
}

#[derive(Debug, Default)]
struct Journal {
    records: Vec<OperationRecord>,
    op_counter: u64,
}

#[derive(Debug, Default)]
pub struct LabEngine {
    store: LabStore,
    journal: Mutex<Journal>,
}

impl LabEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LabState) -> Self {
        Self {
            store: LabStore::new(state),
            journal: Mutex::default(),
        }
    }

    pub fn store(&self) -> &LabStore {
        &self.store
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            protocol_version: PROTOCOL_VERSION.to_string(),
            supported_operations: [
                "CreateEquipmentType",
                "CreateEquipment",
                "SetEquipmentNotes",
                "CreateReagentType",
                "CreateReagent",
                "SetReagentNotes",
                "CreateUser",
                "CreatePlateConfiguration",
                "SetContainerNotes",
                "DiscardTube",
                "SetParameter",
                "PlateSamples",
                "PrepareOligoPlate",
                "ExtractGdna",
                "CompressPlates",
                "PrepareAmpliconLibrary",
                "Normalize",
                "PrepareShotgunLibrary",
                "Quantify",
                "Pool",
                "Sequence",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            pooling_functions: PoolingFunction::names(),
            sample_sheet_assays: vec!["Amplicon".to_string(), "Metagenomics".to_string()],
            transactional_operations: true,
        }
    }

    pub fn operation_log(&self) -> Vec<OperationRecord> {
        self.journal.lock().records.clone()
    }

    fn next_op_id(&self) -> OpId {
        let mut journal = self.journal.lock();
        journal.op_counter += 1;
        format!("op-{}", journal.op_counter)
    }

    /// Like `Engine::apply`, with an explicit process timestamp.
    pub fn apply_at(
        &self,
        operator: UserId,
        op: Operation,
        timestamp: DateTime<Utc>,
    ) -> Result<OpResult, LabError> {
        self.apply_internal(operator, op, "interactive", timestamp)
    }

    fn apply_internal(
        &self,
        operator: UserId,
        op: Operation,
        run_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<OpResult, LabError> {
        let op_id = self.next_op_id();
        let result = self
            .store
            .transaction(|tx| execute(tx, &op_id, operator, &op, timestamp))
            .map_err(|e| {
                log::warn!("{op_id} rejected: {e}");
                e
            })?;
        if let Some(process) = result.process_id {
            log::info!(
                "{op_id}: committed process {process} with {} new composition(s)",
                result.created_compositions.len()
            );
        }
        self.journal.lock().records.push(OperationRecord {
            run_id: run_id.to_string(),
            operator,
            op,
            result: result.clone(),
        });
        Ok(result)
    }
}

impl Engine for LabEngine {
    fn apply(&self, operator: UserId, op: Operation) -> Result<OpResult, LabError> {
        self.apply_internal(operator, op, "interactive", Utc::now())
    }

    fn apply_workflow(&self, wf: Workflow) -> Result<Vec<OpResult>, LabError> {
        let mut results = Vec::new();
        for op in wf.ops {
            results.push(self.apply_internal(wf.operator, op, &wf.run_id, Utc::now())?);
        }
        Ok(results)
    }

    fn snapshot(&self) -> Arc<LabState> {
        self.store.snapshot()
    }
}

fn execute(
    tx: &mut LabState,
    op_id: &str,
    operator: UserId,
    op: &Operation,
    timestamp: DateTime<Utc>,
) -> Result<OpResult, LabError> {
    let mut result = OpResult::new(op_id);
    match op {
        Operation::CreateEquipmentType { description } => {
            let id = tx.registry.create_equipment_type(description)?;
            result.created_id = Some(id);
            result
                .messages
                .push(format!("Created equipment type {id} '{description}'"));
        }
        Operation::CreateEquipment {
            external_id,
            equipment_type,
            notes,
        } => {
            let id = tx
                .registry
                .create_equipment(external_id, *equipment_type, notes.clone())?;
            result.created_id = Some(id);
            result
                .messages
                .push(format!("Created equipment {id} '{external_id}'"));
        }
        Operation::SetEquipmentNotes { equipment, notes } => {
            tx.registry.set_equipment_notes(*equipment, notes.clone())?;
            result
                .messages
                .push(format!("Updated notes of equipment {equipment}"));
        }
        Operation::CreateReagentType { description } => {
            let id = tx.registry.create_reagent_type(description)?;
            result.created_id = Some(id);
            result
                .messages
                .push(format!("Created reagent type {id} '{description}'"));
        }
        Operation::CreateReagent {
            external_lot_id,
            reagent_type,
            notes,
        } => {
            let id = tx
                .registry
                .create_reagent(external_lot_id, *reagent_type, notes.clone())?;
            result.created_id = Some(id);
            result
                .messages
                .push(format!("Created reagent {id} lot '{external_lot_id}'"));
        }
        Operation::SetReagentNotes { reagent, notes } => {
            tx.registry.set_reagent_notes(*reagent, notes.clone())?;
            result.messages.push(format!("Updated notes of reagent {reagent}"));
        }
        Operation::CreateUser { name, email } => {
            let id = tx.registry.create_user(name, email)?;
            result.created_id = Some(id);
            result.messages.push(format!("Created user {id} <{email}>"));
        }
        Operation::CreatePlateConfiguration {
            description,
            num_rows,
            num_columns,
        } => {
            let id = tx.create_plate_configuration(description, *num_rows, *num_columns)?;
            result.created_id = Some(id);
            result.messages.push(format!(
                "Created plate configuration {id} ({num_rows}x{num_columns})"
            ));
        }
        Operation::SetContainerNotes { container, notes } => {
            tx.set_container_notes(*container, notes.clone())?;
            result
                .messages
                .push(format!("Updated notes of container {container}"));
        }
        Operation::DiscardTube { container } => {
            if tx.discard_tube(*container)? {
                result.messages.push(format!("Discarded tube {container}"));
            } else {
                result
                    .warnings
                    .push(format!("Tube {container} was already discarded"));
            }
        }
        Operation::SetParameter { name, value } => {
            set_parameter(tx, name, value, &mut result)?;
        }
        process_op => {
            let mut process = ProcessBuilder::begin(tx, operator, timestamp)?;
            let details = run_process(tx, &mut process, process_op, &mut result.warnings)?;
            process.finish(tx, details, &mut result);
        }
    }
    Ok(result)
}

fn set_parameter(
    tx: &mut LabState,
    name: &str,
    value: &serde_json::Value,
    result: &mut OpResult,
) -> Result<(), LabError> {
    let number = |min_inclusive: bool| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && (*v > 0.0 || (min_inclusive && *v == 0.0)))
    };
    let params = &mut tx.parameters;
    match name {
        "percentage_tolerance" => {
            params.percentage_tolerance = number(false).ok_or_else(|| {
                LabError::validation("value", "percentage_tolerance requires a positive number")
            })?;
        }
        "default_blank_volume" => {
            params.default_blank_volume = if value.is_null() {
                None
            } else {
                Some(number(true).ok_or_else(|| {
                    LabError::validation(
                        "value",
                        "default_blank_volume requires null or a non-negative number",
                    )
                })?)
            };
        }
        "sample_well_volume" => {
            params.sample_well_volume = number(false).ok_or_else(|| {
                LabError::validation("value", "sample_well_volume requires a positive number")
            })?;
        }
        _ => return Err(LabError::unsupported(format!("Unknown parameter '{name}'"))),
    }
    result
        .messages
        .push(format!("Set parameter '{name}' to {value}"));
    Ok(())
}

/// Accumulates what a process touches while it runs. Nothing becomes visible
/// until the surrounding transaction commits.
struct ProcessBuilder {
    id: ProcessId,
    operator: UserId,
    timestamp: DateTime<Utc>,
    consumed: Vec<CompositionId>,
    produced: Vec<CompositionId>,
    equipment: Vec<EquipmentId>,
    reagents: Vec<ReagentId>,
}

impl ProcessBuilder {
    fn begin(
        tx: &mut LabState,
        operator: UserId,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, LabError> {
        tx.registry.user(operator)?;
        Ok(Self {
            id: next_id(&mut tx.counters.process),
            operator,
            timestamp,
            consumed: vec![],
            produced: vec![],
            equipment: vec![],
            reagents: vec![],
        })
    }

    fn equipment(&mut self, tx: &LabState, id: EquipmentId) -> Result<(), LabError> {
        tx.registry.equipment(id)?;
        if !self.equipment.contains(&id) {
            self.equipment.push(id);
        }
        Ok(())
    }

    fn reagent(&mut self, tx: &LabState, id: ReagentId) -> Result<(), LabError> {
        tx.registry.reagent(id)?;
        if !self.reagents.contains(&id) {
            self.reagents.push(id);
        }
        Ok(())
    }

    /// Resolves an input, which must come from an earlier committed process.
    fn input(&mut self, tx: &LabState, id: CompositionId) -> Result<Composition, LabError> {
        let composition = tx.composition(id)?;
        if composition.produced_by >= self.id || !tx.processes.contains_key(&composition.produced_by)
        {
            return Err(LabError::state(format!(
                "Composition {id} from process {} is not committed before process {}",
                composition.produced_by, self.id
            )));
        }
        if tx.container(composition.container)?.is_discarded() {
            return Err(LabError::state(format!(
                "Composition {id} is in discarded tube {}",
                composition.container
            )));
        }
        if !self.consumed.contains(&id) {
            self.consumed.push(id);
        }
        Ok(composition.clone())
    }

    fn output(
        &mut self,
        tx: &mut LabState,
        container: ContainerId,
        kind: CompositionKind,
        parents: Vec<ProvenanceEdge>,
    ) -> Result<CompositionId, LabError> {
        let id = tx.add_composition(container, kind, self.id, parents)?;
        self.produced.push(id);
        Ok(id)
    }

    fn finish(self, tx: &mut LabState, details: ProcessDetails, result: &mut OpResult) {
        result.process_id = Some(self.id);
        result.created_plate = details.output_plate();
        result.created_compositions = self.produced.clone();
        result.messages.push(format!(
            "{} process {} produced {} composition(s)",
            details.kind_name(),
            self.id,
            self.produced.len()
        ));
        tx.processes.insert(
            self.id,
            Process {
                id: self.id,
                timestamp: self.timestamp,
                operator: self.operator,
                details,
                consumed: self.consumed,
                produced: self.produced,
                equipment: self.equipment,
                reagents: self.reagents,
            },
        );
    }
}

fn edge(parent: CompositionId, volume_consumed: f64, fraction_of_output: f64) -> ProvenanceEdge {
    ProvenanceEdge {
        parent,
        volume_consumed,
        fraction_of_output,
    }
}

fn require_text(field: &str, value: &str) -> Result<(), LabError> {
    if value.trim().is_empty() {
        return Err(LabError::validation(field, format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_positive(field: &str, value: f64) -> Result<f64, LabError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LabError::validation(
            field,
            format!("{field} must be a positive number, got {value}"),
        ));
    }
    Ok(value)
}

fn new_plate(
    tx: &mut LabState,
    name: &str,
    configuration: PlateConfigurationId,
) -> Result<PlateId, LabError> {
    require_text("plate_name", name)?;
    tx.create_plate(name, configuration)
}

/// Occupied wells of a plate with the composition each one holds.
fn plate_compositions(
    tx: &LabState,
    plate: PlateId,
) -> Result<Vec<(WellPosition, CompositionId)>, LabError> {
    let plate = tx.plate(plate)?;
    plate
        .occupied()
        .map(|(position, container)| {
            tx.container_owner
                .get(&container)
                .map(|id| (position, *id))
                .ok_or_else(|| {
                    LabError::state(format!(
                        "Well {position} of plate '{}' holds no composition",
                        plate.name
                    ))
                })
        })
        .collect()
}

fn nonempty_plate(
    tx: &LabState,
    plate: PlateId,
    field: &str,
) -> Result<Vec<(WellPosition, CompositionId)>, LabError> {
    let wells = plate_compositions(tx, plate)?;
    if wells.is_empty() {
        return Err(LabError::validation(
            field,
            format!("Plate {plate} has no occupied wells"),
        ));
    }
    Ok(wells)
}

/// Wells of an oligo plate keyed by position, after checking its shape.
fn oligo_wells(
    tx: &LabState,
    plate: PlateId,
    like: PlateId,
    field: &str,
) -> Result<BTreeMap<WellPosition, CompositionId>, LabError> {
    if !tx
        .plate(plate)?
        .configuration
        .same_shape(&tx.plate(like)?.configuration)
    {
        return Err(LabError::validation(
            field,
            format!("Plate {plate} does not match the shape of plate {like}"),
        ));
    }
    Ok(plate_compositions(tx, plate)?.into_iter().collect())
}

fn require_kind(
    composition: &Composition,
    field: &str,
    expected: &str,
    ok: bool,
) -> Result<(), LabError> {
    if !ok {
        return Err(LabError::validation(
            field,
            format!(
                "Composition {} is {}, expected {expected}",
                composition.id,
                composition.kind.name()
            ),
        ));
    }
    Ok(())
}

fn require_oligo(composition: &Composition, role: OligoRole, field: &str) -> Result<(), LabError> {
    let ok = matches!(&composition.kind, CompositionKind::Oligo { role: r, .. } if *r == role);
    require_kind(composition, field, &format!("{role:?} oligo"), ok)
}

/// Empties the well holding `composition`, which must not be used up already.
fn draw_whole_well(tx: &mut LabState, composition: &Composition) -> Result<f64, LabError> {
    let remaining = tx.container(composition.container)?.remaining_volume;
    if remaining <= VOLUME_EPSILON {
        return Err(LabError::new(
            ErrorCode::InsufficientVolume,
            format!(
                "Composition {} in container {} is used up",
                composition.id, composition.container
            ),
        ));
    }
    tx.consume_volume(composition.container, remaining)?;
    Ok(remaining)
}

fn is_blank(tx: &LabState, composition: CompositionId) -> Result<bool, LabError> {
    Ok(tx
        .find_in_lineage(composition, |c| c.kind.is_blank())?
        .is_some())
}

fn quantification_measurements(
    tx: &LabState,
    quantification: ProcessId,
    before: ProcessId,
) -> Result<Vec<Measurement>, LabError> {
    let process = tx.process(quantification)?;
    if quantification >= before {
        return Err(LabError::state(format!(
            "Quantification {quantification} is not committed before process {before}"
        )));
    }
    match &process.details {
        ProcessDetails::Quantification { measurements } => Ok(measurements.clone()),
        other => Err(LabError::validation(
            "quantification",
            format!(
                "Process {quantification} is {}, not a quantification",
                other.kind_name()
            ),
        )),
    }
}

fn run_process(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    op: &Operation,
    warnings: &mut Vec<String>,
) -> Result<ProcessDetails, LabError> {
    match op {
        Operation::PlateSamples {
            plate_name,
            configuration,
            samples,
        } => plate_samples(tx, b, plate_name, *configuration, samples),
        Operation::PrepareOligoPlate {
            plate_name,
            configuration,
            role,
            volume,
            oligos,
        } => prepare_oligo_plate(tx, b, plate_name, *configuration, *role, *volume, oligos),
        Operation::ExtractGdna {
            sample_plate,
            plate_name,
            extractor,
            liquid_handler,
            tool,
            extraction_kit,
            volume,
        } => {
            let volume = require_positive("volume", *volume)?;
            for equipment in [*extractor, *liquid_handler, *tool] {
                b.equipment(tx, equipment)?;
            }
            b.reagent(tx, *extraction_kit)?;
            let plate = extract_gdna(tx, b, *sample_plate, plate_name, volume)?;
            Ok(ProcessDetails::GdnaExtraction {
                sample_plate: *sample_plate,
                plate,
                extractor: *extractor,
                liquid_handler: *liquid_handler,
                tool: *tool,
                extraction_kit: *extraction_kit,
                volume,
            })
        }
        Operation::CompressPlates {
            sources,
            plate_name,
            robot,
        } => {
            b.equipment(tx, *robot)?;
            let plate = compress_plates(tx, b, sources, plate_name)?;
            Ok(ProcessDetails::PlateCompression {
                sources: sources.clone(),
                plate,
                robot: *robot,
            })
        }
        Operation::PrepareAmpliconLibrary {
            gdna_plate,
            primer_plate,
            plate_name,
            liquid_handler,
            tools,
            master_mix,
            water,
            volume,
            template_volume,
            primer_volume,
        } => {
            let volume = require_positive("volume", *volume)?;
            let template_volume = require_positive(
                "template_volume",
                template_volume.unwrap_or(DEFAULT_TEMPLATE_VOLUME),
            )?;
            let primer_volume =
                require_positive("primer_volume", primer_volume.unwrap_or(DEFAULT_PRIMER_VOLUME))?;
            b.equipment(tx, *liquid_handler)?;
            for tool in tools {
                b.equipment(tx, *tool)?;
            }
            b.reagent(tx, *master_mix)?;
            b.reagent(tx, *water)?;
            let plate = prepare_amplicon_library(
                tx,
                b,
                *gdna_plate,
                *primer_plate,
                plate_name,
                volume,
                template_volume,
                primer_volume,
            )?;
            Ok(ProcessDetails::LibraryPrep16S {
                gdna_plate: *gdna_plate,
                primer_plate: *primer_plate,
                plate,
                liquid_handler: *liquid_handler,
                tools: tools.clone(),
                master_mix: *master_mix,
                water: *water,
                volume,
                template_volume,
                primer_volume,
            })
        }
        Operation::Normalize {
            quantification,
            plate_name,
            water,
            total_volume,
            target_concentration,
        } => {
            let total_volume = require_positive("total_volume", *total_volume)?;
            let target = require_positive("target_concentration", *target_concentration)?;
            b.reagent(tx, *water)?;
            let plate = normalize(tx, b, *quantification, plate_name, total_volume, target)?;
            Ok(ProcessDetails::Normalization {
                quantification: *quantification,
                plate,
                water: *water,
                total_volume,
                target_concentration: target,
            })
        }
        Operation::PrepareShotgunLibrary {
            normalized_plate,
            plate_name,
            kappa_hyper_plus_kit,
            stub_lot,
            target_dna_ng,
            i5_plate,
            i7_plate,
            adapter_volume,
        } => {
            let target_dna_ng = require_positive("target_dna_ng", *target_dna_ng)?;
            let adapter_volume = require_positive(
                "adapter_volume",
                adapter_volume.unwrap_or(DEFAULT_ADAPTER_VOLUME),
            )?;
            b.reagent(tx, *kappa_hyper_plus_kit)?;
            b.reagent(tx, *stub_lot)?;
            let plate = prepare_shotgun_library(
                tx,
                b,
                *normalized_plate,
                plate_name,
                target_dna_ng,
                (*i5_plate, *i7_plate),
                adapter_volume,
                warnings,
            )?;
            Ok(ProcessDetails::LibraryPrepShotgun {
                normalized_plate: *normalized_plate,
                plate,
                kappa_hyper_plus_kit: *kappa_hyper_plus_kit,
                stub_lot: *stub_lot,
                target_dna_ng,
                i5_plate: *i5_plate,
                i7_plate: *i7_plate,
                adapter_volume,
            })
        }
        Operation::Quantify { target } => quantify(tx, b, target),
        Operation::Pool {
            quantification,
            pool_name,
            components,
            function,
            robot,
        } => {
            require_text("pool_name", pool_name)?;
            if let Some(robot) = robot {
                b.equipment(tx, *robot)?;
            }
            let (pool, components) = pool(tx, b, *quantification, pool_name, components, function)?;
            Ok(ProcessDetails::Pooling {
                quantification: *quantification,
                pool_name: pool_name.clone(),
                pool,
                components,
                function: function.clone(),
                robot: *robot,
            })
        }
        Operation::Sequence {
            run_name,
            description,
            platform,
            fwd_cycles,
            rev_cycles,
            principal_investigator,
            contacts,
            pools,
        } => {
            require_text("run_name", run_name)?;
            if *fwd_cycles == 0 {
                return Err(LabError::validation("fwd_cycles", "Read length must be positive"));
            }
            if *rev_cycles == 0 {
                return Err(LabError::validation("rev_cycles", "Read length must be positive"));
            }
            if pools.is_empty() {
                return Err(LabError::validation("pools", "A run needs at least one pool"));
            }
            b.equipment(tx, *platform)?;
            tx.registry.user(*principal_investigator)?;
            for contact in contacts {
                tx.registry.user(*contact)?;
            }
            let mut seen = BTreeSet::new();
            for id in pools {
                if !seen.insert(*id) {
                    return Err(LabError::validation(
                        "pools",
                        format!("Pool {id} is listed twice"),
                    ));
                }
                let pool = b.input(tx, *id)?;
                let ok = matches!(pool.kind, CompositionKind::Pool { .. });
                require_kind(&pool, "pools", "a pool", ok)?;
            }
            detect_assay(tx, pools)?;
            Ok(ProcessDetails::Sequencing {
                run: SequencingRun {
                    run_name: run_name.clone(),
                    description: description.clone(),
                    platform: *platform,
                    fwd_cycles: *fwd_cycles,
                    rev_cycles: *rev_cycles,
                    principal_investigator: *principal_investigator,
                    contacts: contacts.clone(),
                    pools: pools.clone(),
                },
            })
        }
        other => Err(LabError::unsupported(format!(
            "{other:?} does not record a process"
        ))),
    }
}

fn plate_samples(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    plate_name: &str,
    configuration: PlateConfigurationId,
    samples: &[PlatedSample],
) -> Result<ProcessDetails, LabError> {
    if samples.is_empty() {
        return Err(LabError::validation("samples", "No samples to plate"));
    }
    let plate = new_plate(tx, plate_name, configuration)?;
    let volume = tx.parameters.sample_well_volume;
    for sample in samples {
        let position = WellPosition::new(sample.row, sample.col);
        let sample_id = sample.sample_id.trim();
        require_text("sample_id", sample_id)?;
        check_sheet_field("sample_id", sample_id)?;
        let kind = if sample_id.eq_ignore_ascii_case(BLANK_SAMPLE_ID) {
            CompositionKind::Sample {
                content: format!("{BLANK_SAMPLE_ID}.{plate}.{position}"),
                blank: true,
            }
        } else {
            CompositionKind::Sample {
                content: sample_id.to_string(),
                blank: false,
            }
        };
        let container = tx.create_well(plate, position, volume)?;
        b.output(tx, container, kind, vec![])?;
    }
    Ok(ProcessDetails::SamplePlating { plate })
}

fn prepare_oligo_plate(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    plate_name: &str,
    configuration: PlateConfigurationId,
    role: OligoRole,
    volume: f64,
    oligos: &[OligoWell],
) -> Result<ProcessDetails, LabError> {
    let volume = require_positive("volume", volume)?;
    if oligos.is_empty() {
        return Err(LabError::validation("oligos", "No oligos to plate"));
    }
    let plate = new_plate(tx, plate_name, configuration)?;
    for oligo in oligos {
        require_text("name", &oligo.name)?;
        check_sheet_field("name", &oligo.name)?;
        if oligo.sequence.is_empty()
            || !oligo
                .sequence
                .chars()
                .all(|c| matches!(c.to_ascii_uppercase(), 'A' | 'C' | 'G' | 'T' | 'N'))
        {
            return Err(LabError::validation(
                "sequence",
                format!("Oligo '{}' has invalid sequence '{}'", oligo.name, oligo.sequence),
            ));
        }
        let position = WellPosition::new(oligo.row, oligo.col);
        let container = tx.create_well(plate, position, volume)?;
        let kind = CompositionKind::Oligo {
            role,
            name: oligo.name.clone(),
            sequence: oligo.sequence.to_ascii_uppercase(),
        };
        b.output(tx, container, kind, vec![])?;
    }
    Ok(ProcessDetails::OligoPlatePreparation { plate, role })
}

/// Each sample well is used up; its gDNA lands at the same position.
fn extract_gdna(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    sample_plate: PlateId,
    plate_name: &str,
    volume: f64,
) -> Result<PlateId, LabError> {
    let wells = nonempty_plate(tx, sample_plate, "sample_plate")?;
    let configuration = tx.plate(sample_plate)?.configuration.id;
    let plate = new_plate(tx, plate_name, configuration)?;
    for (position, id) in wells {
        let sample = b.input(tx, id)?;
        let ok = matches!(sample.kind, CompositionKind::Sample { .. });
        require_kind(&sample, "sample_plate", "a sample", ok)?;
        let drawn = draw_whole_well(tx, &sample)?;
        let container = tx.create_well(plate, position, volume)?;
        b.output(tx, container, CompositionKind::Gdna, vec![edge(id, drawn, 1.0)])?;
    }
    Ok(plate)
}

fn compress_plates(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    sources: &[PlateId],
    plate_name: &str,
) -> Result<PlateId, LabError> {
    if sources.is_empty() || sources.len() > 4 {
        return Err(LabError::validation(
            "sources",
            format!("Compression takes 1 to 4 plates, got {}", sources.len()),
        ));
    }
    if sources.iter().collect::<BTreeSet<_>>().len() != sources.len() {
        return Err(LabError::validation("sources", "A plate is listed twice"));
    }
    let shape = tx.plate(sources[0])?.configuration.clone();
    for source in sources {
        if !tx.plate(*source)?.configuration.same_shape(&shape) {
            return Err(LabError::validation(
                "sources",
                format!("Plate {source} does not match the shape of plate {}", sources[0]),
            ));
        }
    }
    let configuration =
        tx.find_or_create_plate_configuration(shape.num_rows * 2, shape.num_columns * 2)?;
    let plate = new_plate(tx, plate_name, configuration)?;
    for (quadrant, source) in sources.iter().enumerate() {
        for (position, id) in plate_compositions(tx, *source)? {
            let gdna = b.input(tx, id)?;
            require_kind(&gdna, "sources", "gDNA", gdna.kind == CompositionKind::Gdna)?;
            let drawn = draw_whole_well(tx, &gdna)?;
            let container = tx.create_well(plate, position.compressed(quadrant), drawn)?;
            b.output(
                tx,
                container,
                CompositionKind::CompressedGdna,
                vec![edge(id, drawn, 1.0)],
            )?;
        }
    }
    Ok(plate)
}

#[allow(clippy::too_many_arguments)]
fn prepare_amplicon_library(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    gdna_plate: PlateId,
    primer_plate: PlateId,
    plate_name: &str,
    volume: f64,
    template_volume: f64,
    primer_volume: f64,
) -> Result<PlateId, LabError> {
    let wells = nonempty_plate(tx, gdna_plate, "gdna_plate")?;
    let primers = oligo_wells(tx, primer_plate, gdna_plate, "primer_plate")?;
    let configuration = tx.plate(gdna_plate)?.configuration.id;
    let plate = new_plate(tx, plate_name, configuration)?;
    for (position, id) in wells {
        let gdna = b.input(tx, id)?;
        let ok = matches!(gdna.kind, CompositionKind::Gdna | CompositionKind::CompressedGdna);
        require_kind(&gdna, "gdna_plate", "gDNA", ok)?;
        let primer_id = *primers.get(&position).ok_or_else(|| {
            LabError::validation("primer_plate", format!("No primer in well {position}"))
        })?;
        let primer = b.input(tx, primer_id)?;
        require_oligo(&primer, OligoRole::Primer, "primer_plate")?;
        tx.consume_volume(gdna.container, template_volume)?;
        tx.consume_volume(primer.container, primer_volume)?;
        let container = tx.create_well(plate, position, volume)?;
        b.output(
            tx,
            container,
            CompositionKind::AmpliconLibrary,
            vec![
                edge(id, template_volume, template_volume / volume),
                edge(primer_id, primer_volume, primer_volume / volume),
            ],
        )?;
    }
    Ok(plate)
}

/// Dilutes every quantified well towards `target` ng/µL in `total_volume`.
fn normalize(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    quantification: ProcessId,
    plate_name: &str,
    total_volume: f64,
    target: f64,
) -> Result<PlateId, LabError> {
    let measurements = quantification_measurements(tx, quantification, b.id)?;
    let mut source_plate = None;
    let mut wells = Vec::with_capacity(measurements.len());
    for m in measurements {
        let container = tx.container(tx.composition(m.composition)?.container)?;
        let (plate, position) = container.well_position().ok_or_else(|| {
            LabError::validation(
                "quantification",
                format!("Composition {} is not in a plate well", m.composition),
            )
        })?;
        match source_plate {
            None => source_plate = Some(plate),
            Some(p) if p != plate => {
                return Err(LabError::validation(
                    "quantification",
                    "Quantification spans more than one plate",
                ));
            }
            Some(_) => {}
        }
        wells.push((position, m));
    }
    let Some(source_plate) = source_plate else {
        return Err(LabError::validation(
            "quantification",
            format!("Quantification {quantification} measured nothing"),
        ));
    };
    let configuration = tx.plate(source_plate)?.configuration.id;
    let plate = new_plate(tx, plate_name, configuration)?;
    for (position, m) in wells {
        let source = b.input(tx, m.composition)?;
        let c = m.concentration;
        let dna_volume = if c > 0.0 {
            (total_volume * target / c).min(total_volume)
        } else {
            total_volume
        };
        let water_volume = total_volume - dna_volume;
        tx.consume_volume(source.container, dna_volume)?;
        let container = tx.create_well(plate, position, total_volume)?;
        let id = b.output(
            tx,
            container,
            CompositionKind::Normalized {
                dna_volume,
                water_volume,
            },
            vec![edge(m.composition, dna_volume, dna_volume / total_volume)],
        )?;
        if let Some(normalized) = tx.compositions.get_mut(&id) {
            normalized.concentration = Some(c * dna_volume / total_volume);
        }
    }
    Ok(plate)
}

#[allow(clippy::too_many_arguments)]
fn prepare_shotgun_library(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    normalized_plate: PlateId,
    plate_name: &str,
    target_dna_ng: f64,
    (i5_plate, i7_plate): (PlateId, PlateId),
    adapter_volume: f64,
    warnings: &mut Vec<String>,
) -> Result<PlateId, LabError> {
    let wells = nonempty_plate(tx, normalized_plate, "normalized_plate")?;
    let i5 = oligo_wells(tx, i5_plate, normalized_plate, "i5_plate")?;
    let i7 = oligo_wells(tx, i7_plate, normalized_plate, "i7_plate")?;
    let configuration = tx.plate(normalized_plate)?.configuration.id;
    let plate = new_plate(tx, plate_name, configuration)?;
    for (position, id) in wells {
        let normalized = b.input(tx, id)?;
        let ok = matches!(normalized.kind, CompositionKind::Normalized { .. });
        require_kind(&normalized, "normalized_plate", "normalized gDNA", ok)?;
        let remaining = tx.container(normalized.container)?.remaining_volume;
        let blank = is_blank(tx, id)?;
        let wanted = match normalized.concentration {
            Some(c) if c > 0.0 && !blank => target_dna_ng / c,
            _ => remaining,
        };
        if wanted > remaining {
            let warning = format!(
                "Well {position} holds {remaining} µL, less than the {wanted} µL for {target_dna_ng} ng"
            );
            log::warn!("{warning}");
            warnings.push(warning);
        }
        let dna_volume = wanted.min(remaining);

        let mut adapters = Vec::with_capacity(2);
        for (adapter_wells, role, field) in [
            (&i5, OligoRole::I5Adapter, "i5_plate"),
            (&i7, OligoRole::I7Adapter, "i7_plate"),
        ] {
            let adapter_id = *adapter_wells.get(&position).ok_or_else(|| {
                LabError::validation(field, format!("No adapter in well {position}"))
            })?;
            let adapter = b.input(tx, adapter_id)?;
            require_oligo(&adapter, role, field)?;
            adapters.push(adapter);
        }

        tx.consume_volume(normalized.container, dna_volume)?;
        let total = dna_volume + adapter_volume * adapters.len() as f64;
        let mut parents = vec![edge(id, dna_volume, dna_volume / total)];
        for adapter in &adapters {
            tx.consume_volume(adapter.container, adapter_volume)?;
            parents.push(edge(adapter.id, adapter_volume, adapter_volume / total));
        }
        let container = tx.create_well(plate, position, total)?;
        b.output(tx, container, CompositionKind::ShotgunLibrary, parents)?;
    }
    Ok(plate)
}

fn quantify(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    target: &QuantificationTarget,
) -> Result<ProcessDetails, LabError> {
    let measurements = match target {
        QuantificationTarget::Plate {
            plate,
            concentrations,
        } => {
            let configuration = &tx.plate(*plate)?.configuration;
            let (rows, cols) = (configuration.num_rows as usize, configuration.num_columns as usize);
            if concentrations.len() != rows || concentrations.iter().any(|r| r.len() != cols) {
                let got_cols = concentrations.first().map(Vec::len).unwrap_or(0);
                return Err(LabError::validation(
                    "concentrations",
                    format!(
                        "Concentration matrix is {}x{got_cols} but plate {plate} is {rows}x{cols}",
                        concentrations.len()
                    ),
                ));
            }
            plate_compositions(tx, *plate)?
                .into_iter()
                .map(|(position, composition)| Measurement {
                    composition,
                    concentration: concentrations[position.row as usize - 1]
                        [position.col as usize - 1],
                })
                .collect::<Vec<_>>()
        }
        QuantificationTarget::Compositions { measurements } => measurements.clone(),
    };
    if measurements.is_empty() {
        return Err(LabError::validation("measurements", "Nothing to quantify"));
    }
    let mut seen = BTreeSet::new();
    for m in &measurements {
        if !m.concentration.is_finite() || m.concentration < 0.0 {
            return Err(LabError::validation(
                "concentrations",
                format!(
                    "Concentration {} for composition {} must be >= 0",
                    m.concentration, m.composition
                ),
            ));
        }
        if !seen.insert(m.composition) {
            return Err(LabError::validation(
                "measurements",
                format!("Composition {} is measured twice", m.composition),
            ));
        }
        b.input(tx, m.composition)?;
    }
    for m in &measurements {
        if let Some(composition) = tx.compositions.get_mut(&m.composition) {
            composition.concentration = Some(m.concentration);
        }
    }
    Ok(ProcessDetails::Quantification { measurements })
}

/// Draws every component into a new tube. Percentages are validated before
/// any volume moves.
fn pool(
    tx: &mut LabState,
    b: &mut ProcessBuilder,
    quantification: Option<ProcessId>,
    pool_name: &str,
    components: &[PoolComponent],
    function: &PoolingFunction,
) -> Result<(CompositionId, Vec<PoolComponent>), LabError> {
    let measured: BTreeMap<CompositionId, f64> = match quantification {
        Some(q) => quantification_measurements(tx, q, b.id)?
            .into_iter()
            .map(|m| (m.composition, m.concentration))
            .collect(),
        None => BTreeMap::new(),
    };
    let mut seen = BTreeSet::new();
    let mut inputs = Vec::with_capacity(components.len());
    let mut containers = Vec::with_capacity(components.len());
    for component in components {
        let id = component.composition;
        if !seen.insert(id) {
            return Err(LabError::validation(
                "components",
                format!("Composition {id} is listed twice"),
            ));
        }
        let source = b.input(tx, id)?;
        inputs.push(PoolingInput {
            composition: id,
            concentration: measured.get(&id).copied().or(source.concentration),
            blank: is_blank(tx, id)?,
            input_volume: component.input_volume,
            percentage_of_output: component.percentage_of_output,
        });
        containers.push(source.container);
    }
    let policy = PoolingPolicy {
        percentage_tolerance: tx.parameters.percentage_tolerance,
        default_blank_volume: tx.parameters.default_blank_volume,
    };
    let volumes = function.compute(&inputs, &policy)?;

    let mut parents = Vec::with_capacity(inputs.len());
    let mut recorded = Vec::with_capacity(inputs.len());
    for ((input, container), volume) in inputs.iter().zip(containers).zip(&volumes) {
        tx.consume_volume(container, *volume)?;
        parents.push(edge(input.composition, *volume, input.percentage_of_output));
        recorded.push(PoolComponent {
            composition: input.composition,
            input_volume: *volume,
            percentage_of_output: input.percentage_of_output,
        });
    }
    let tube = tx.create_tube(pool_name, volumes.iter().sum());
    let pool = b.output(
        tx,
        tube,
        CompositionKind::Pool {
            name: pool_name.to_string(),
        },
        parents,
    )?;
    Ok((pool, recorded))
}
