//! Fixtures shared by the pipeline tests.

use crate::{
    composition::OligoRole,
    engine::{Engine, LabEngine, OligoWell, OpResult, Operation, PlatedSample, QuantificationTarget},
    error::LabError,
    plate::WellPosition,
    pooling::{AmpliconParameters, EqualParameters, PoolingFunction},
    process::PoolComponent,
};
use chrono::{DateTime, Utc};
use labtrack_protocol::{
    CompositionId, EquipmentId, PlateConfigurationId, PlateId, ProcessId, ReagentId, UserId,
};

pub(crate) const RUN_TIMESTAMP: &str = "2017-10-25T19:10:25.123456Z";

pub(crate) fn run_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(RUN_TIMESTAMP)
        .unwrap()
        .with_timezone(&Utc)
}

fn created(engine: &LabEngine, op: Operation) -> u64 {
    engine.apply(0, op).unwrap().created_id.unwrap()
}

/// An engine with the users, equipment and reagents a full run needs.
pub(crate) struct Lab {
    pub engine: LabEngine,
    pub admin: UserId,
    pub contacts: Vec<UserId>,
    pub extractor: EquipmentId,
    pub liquid_handler: EquipmentId,
    pub tool: EquipmentId,
    pub robot: EquipmentId,
    pub sequencer: EquipmentId,
    pub kit: ReagentId,
    pub master_mix: ReagentId,
    pub water: ReagentId,
    pub kappa: ReagentId,
    pub stub: ReagentId,
}

impl Lab {
    pub fn new() -> Self {
        let engine = LabEngine::new();
        let user = |name: &str, email: &str| {
            created(
                &engine,
                Operation::CreateUser {
                    name: name.to_string(),
                    email: email.to_string(),
                },
            )
        };
        let admin = user("Admin", "admin@foo.bar");
        let contacts = vec![user("Demo", "demo@microbio.me"), user("Dude", "test@foo.bar")];

        let equipment = |kind: &str, external_id: &str| {
            let equipment_type = created(
                &engine,
                Operation::CreateEquipmentType {
                    description: kind.to_string(),
                },
            );
            created(
                &engine,
                Operation::CreateEquipment {
                    external_id: external_id.to_string(),
                    equipment_type,
                    notes: None,
                },
            )
        };
        let extractor = equipment("King Fisher", "KF1");
        let liquid_handler = equipment("EpMotion", "LUCY");
        let tool = equipment("tm 1000 8 channel pipette head", "108379Z");
        let robot = equipment("echo", "ECHO");
        let sequencer = equipment("MiSeq", "KLM");

        let reagent = |kind: &str, lot: &str| {
            let reagent_type = created(
                &engine,
                Operation::CreateReagentType {
                    description: kind.to_string(),
                },
            );
            created(
                &engine,
                Operation::CreateReagent {
                    external_lot_id: lot.to_string(),
                    reagent_type,
                    notes: None,
                },
            )
        };
        let kit = reagent("extraction kit", "157022406");
        let master_mix = reagent("master mix", "443912");
        let water = reagent("water", "RNBF7110");
        let kappa = reagent("kappa hyper plus kit", "KHP1");
        let stub = reagent("shotgun stubs", "STUBS1");

        Self {
            engine,
            admin,
            contacts,
            extractor,
            liquid_handler,
            tool,
            robot,
            sequencer,
            kit,
            master_mix,
            water,
            kappa,
            stub,
        }
    }

    pub fn run(&self, op: Operation) -> OpResult {
        self.engine.apply(self.admin, op).unwrap()
    }

    pub fn try_run(&self, op: Operation) -> Result<OpResult, LabError> {
        self.engine.apply(self.admin, op)
    }

    pub fn config(&self, rows: u32, cols: u32) -> PlateConfigurationId {
        self.run(Operation::CreatePlateConfiguration {
            description: format!("{rows}x{cols}"),
            num_rows: rows,
            num_columns: cols,
        })
        .created_id
        .unwrap()
    }

    /// Plates `ids` in row-major order.
    pub fn plate_samples(&self, name: &str, rows: u32, cols: u32, ids: &[&str]) -> PlateId {
        let configuration = self.config(rows, cols);
        let samples = ids
            .iter()
            .enumerate()
            .map(|(i, id)| PlatedSample {
                row: i as u32 / cols + 1,
                col: i as u32 % cols + 1,
                sample_id: id.to_string(),
            })
            .collect();
        self.run(Operation::PlateSamples {
            plate_name: name.to_string(),
            configuration,
            samples,
        })
        .created_plate
        .unwrap()
    }

    pub fn extract(&self, sample_plate: PlateId, volume: f64) -> PlateId {
        self.run(Operation::ExtractGdna {
            sample_plate,
            plate_name: format!("gDNA of {sample_plate}"),
            extractor: self.extractor,
            liquid_handler: self.liquid_handler,
            tool: self.tool,
            extraction_kit: self.kit,
            volume,
        })
        .created_plate
        .unwrap()
    }

    pub fn oligo_plate(
        &self,
        name: &str,
        role: OligoRole,
        rows: u32,
        cols: u32,
        oligos: &[(&str, &str)],
    ) -> PlateId {
        let configuration = self.config(rows, cols);
        let oligos = oligos
            .iter()
            .enumerate()
            .map(|(i, (name, sequence))| OligoWell {
                row: i as u32 / cols + 1,
                col: i as u32 % cols + 1,
                name: name.to_string(),
                sequence: sequence.to_string(),
            })
            .collect();
        self.run(Operation::PrepareOligoPlate {
            plate_name: name.to_string(),
            configuration,
            role,
            volume: 10.0,
            oligos,
        })
        .created_plate
        .unwrap()
    }

    pub fn quantify_plate(&self, plate: PlateId, concentrations: Vec<Vec<f64>>) -> ProcessId {
        self.run(Operation::Quantify {
            target: QuantificationTarget::Plate {
                plate,
                concentrations,
            },
        })
        .process_id
        .unwrap()
    }

    pub fn composition_at(&self, plate: PlateId, row: u32, col: u32) -> CompositionId {
        let state = self.engine.snapshot();
        let container = state
            .plate(plate)
            .unwrap()
            .well(WellPosition::new(row, col))
            .unwrap();
        state.container_owner[&container]
    }

    fn components(&self, plate: PlateId, wells: &[(u32, u32)]) -> Vec<PoolComponent> {
        wells
            .iter()
            .map(|(row, col)| PoolComponent {
                composition: self.composition_at(plate, *row, *col),
                input_volume: 0.0,
                percentage_of_output: 1.0 / wells.len() as f64,
            })
            .collect()
    }

    pub fn sequence(&self, run_name: &str, pools: Vec<CompositionId>) -> ProcessId {
        self.engine
            .apply_at(
                self.admin,
                Operation::Sequence {
                    run_name: run_name.to_string(),
                    description: None,
                    platform: self.sequencer,
                    fwd_cycles: 151,
                    rev_cycles: 151,
                    principal_investigator: self.admin,
                    contacts: self.contacts.clone(),
                    pools,
                },
                run_timestamp(),
            )
            .unwrap()
            .process_id
            .unwrap()
    }

    fn sample_plate(&self, name: &str) -> PlateId {
        self.plate_samples(
            name,
            2,
            2,
            &["1.SKB1.640202", "1.SKB2.640194", "1.SKB3.640195", "blank"],
        )
    }

    /// Samples, gDNA, 16S library, one amplicon pool, sequencing run.
    pub fn amplicon_run(&self) -> ProcessId {
        let gdna = self.extract(self.sample_plate("Test plate 1"), 100.0);
        let primers = self.oligo_plate(
            "EMP primer plate 1",
            OligoRole::Primer,
            2,
            2,
            &[
                ("EMP_1", "AGCCTTCGTCGC"),
                ("EMP_2", "TCCATACCGGAA"),
                ("EMP_3", "AGCCCTGCTACA"),
                ("EMP_4", "CCTAACGGTCCA"),
            ],
        );
        let library = self
            .run(Operation::PrepareAmpliconLibrary {
                gdna_plate: gdna,
                primer_plate: primers,
                plate_name: "Test library plate 1".to_string(),
                liquid_handler: self.liquid_handler,
                tools: vec![self.tool],
                master_mix: self.master_mix,
                water: self.water,
                volume: 75.0,
                template_volume: None,
                primer_volume: None,
            })
            .created_plate
            .unwrap();
        let quantification =
            self.quantify_plate(library, vec![vec![10.0, 20.0], vec![40.0, 0.0]]);
        let pool = self.run(Operation::Pool {
            quantification: Some(quantification),
            pool_name: "Test pool 1".to_string(),
            components: self.components(library, &[(1, 1), (1, 2), (2, 1), (2, 2)]),
            function: PoolingFunction::Amplicon(AmpliconParameters {
                dna_amount: 240.0,
                min_val: 1.0,
                max_val: 15.0,
                blank_volume: Some(2.0),
            }),
            robot: Some(self.robot),
        });
        self.sequence("Test Run.1", pool.created_compositions)
    }

    /// Samples through normalization and shotgun prep into two pools, one
    /// per lane.
    pub fn shotgun_run(&self) -> ProcessId {
        let gdna = self.extract(self.sample_plate("Test plate 2"), 100.0);
        let quantification = self.quantify_plate(gdna, vec![vec![10.0; 2]; 2]);
        let normalized = self
            .run(Operation::Normalize {
                quantification,
                plate_name: "Test normalized plate".to_string(),
                water: self.water,
                total_volume: 10.0,
                target_concentration: 2.0,
            })
            .created_plate
            .unwrap();
        let i5 = self.oligo_plate(
            "i5 plate",
            OligoRole::I5Adapter,
            2,
            2,
            &[
                ("iTru5_08_A", "CATCTGCT"),
                ("iTru5_08_B", "ACGTACGA"),
                ("iTru5_08_C", "TCGATCGA"),
                ("iTru5_08_D", "GATCGATC"),
            ],
        );
        let i7 = self.oligo_plate(
            "i7 plate",
            OligoRole::I7Adapter,
            2,
            2,
            &[
                ("iTru7_101_09", "TGTACACC"),
                ("iTru7_101_10", "ACACGTGT"),
                ("iTru7_101_11", "GGTTAACC"),
                ("iTru7_101_12", "CCAATTGG"),
            ],
        );
        let library = self
            .run(Operation::PrepareShotgunLibrary {
                normalized_plate: normalized,
                plate_name: "Test shotgun library plate".to_string(),
                kappa_hyper_plus_kit: self.kappa,
                stub_lot: self.stub,
                target_dna_ng: 5.0,
                i5_plate: i5,
                i7_plate: i7,
                adapter_volume: None,
            })
            .created_plate
            .unwrap();
        let mut pools = Vec::new();
        for (name, wells) in [
            ("Shotgun pool 1", [(1, 1), (1, 2)]),
            ("Shotgun pool 2", [(2, 1), (2, 2)]),
        ] {
            let pool = self.run(Operation::Pool {
                quantification: None,
                pool_name: name.to_string(),
                components: self.components(library, &wells),
                function: PoolingFunction::Equal(EqualParameters {
                    total_vol: 2.0,
                    blank_volume: None,
                }),
                robot: None,
            });
            pools.extend(pool.created_compositions);
        }
        self.sequence("TestShotgunRun1", pools)
    }
}
