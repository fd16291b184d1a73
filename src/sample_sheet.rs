//! Instrument sample sheets for committed sequencing runs.
//!
//! Nothing here is stored: every field comes from the run record, the user
//! registry and the provenance graph, so rendering the same run twice gives
//! the same bytes. Section order, labels and date formats are read by the
//! instrument control software and must stay exactly as they are.

use crate::{
    composition::{Composition, CompositionKind, OligoRole},
    error::LabError,
    process::SequencingRun,
    store::LabState,
};
use itertools::Itertools;
use labtrack_protocol::{CompositionId, ProcessId};
use serde::{Deserialize, Serialize};

/// Index column value for amplicon runs, which are demultiplexed downstream.
pub const AMPLICON_BARCODE_PLACEHOLDER: &str = "NNNNNNNNNNNN";

const AMPLICON_DATA_HEADER: &str =
    "Sample_ID,Sample_Name,Sample_Plate,Sample_Well,I7_Index_ID,index,Sample_Project,Description,,";
const SHOTGUN_DATA_HEADER: &str = "Lane,Sample_ID,Sample_Name,Sample_Plate,Sample_Well,I7_Index_ID,index,I5_Index_ID,index2,Sample_Project,Description";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assay {
    Amplicon,
    Metagenomics,
}

impl Assay {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amplicon => "Amplicon",
            Self::Metagenomics => "Metagenomics",
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9-]` with `_`.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Free text copied verbatim into sheet cells may not contain a field or
/// line separator.
pub fn check_sheet_field(field: &str, value: &str) -> Result<(), LabError> {
    if value.contains([',', '\n', '\r']) {
        return Err(LabError::validation(
            field,
            format!("{field} '{}' must not contain commas or line breaks", value.escape_debug()),
        ));
    }
    Ok(())
}

/// Library preparation the pooled material went through.
pub fn detect_assay(state: &LabState, pools: &[CompositionId]) -> Result<Assay, LabError> {
    let (mut amplicon, mut shotgun) = (false, false);
    for pool in pools {
        for composition in state.trace_lineage(*pool)? {
            match composition.kind {
                CompositionKind::AmpliconLibrary => amplicon = true,
                CompositionKind::ShotgunLibrary => shotgun = true,
                _ => {}
            }
        }
    }
    match (amplicon, shotgun) {
        (true, false) => Ok(Assay::Amplicon),
        (false, true) => Ok(Assay::Metagenomics),
        (true, true) => Err(LabError::validation(
            "pools",
            "Run mixes amplicon and shotgun libraries",
        )),
        (false, false) => Err(LabError::validation(
            "pools",
            "No library preparation found in the pooled lineage",
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotgunRow {
    pub lane: usize,
    pub sample_id: String,
    pub plate: String,
    pub well: String,
    pub i7_name: String,
    pub i7_index: String,
    pub i5_name: String,
    pub i5_index: String,
    pub project: String,
    pub description: String,
}

impl ShotgunRow {
    fn render(&self) -> String {
        let lane = self.lane.to_string();
        let fields: [&str; 11] = [
            &lane,
            &self.sample_id,
            &self.sample_id,
            &self.plate,
            &self.well,
            &self.i7_name,
            &self.i7_index,
            &self.i5_name,
            &self.i5_index,
            &self.project,
            &self.description,
        ];
        fields.join(",")
    }
}

fn originating_sample<'a>(
    state: &'a LabState,
    library: &Composition,
) -> Result<&'a str, LabError> {
    match state
        .find_in_lineage(library.id, |c| matches!(c.kind, CompositionKind::Sample { .. }))?
        .map(|c| &c.kind)
    {
        Some(CompositionKind::Sample { content, .. }) => Ok(content),
        _ => Err(LabError::state(format!(
            "Library {} does not trace back to a sample",
            library.id
        ))),
    }
}

fn adapter<'a>(
    state: &'a LabState,
    library: &Composition,
    wanted: OligoRole,
) -> Result<(&'a str, &'a str), LabError> {
    for edge in &library.parents {
        if let CompositionKind::Oligo {
            role,
            name,
            sequence,
        } = &state.composition(edge.parent)?.kind
        {
            if *role == wanted {
                return Ok((name, sequence));
            }
        }
    }
    Err(LabError::state(format!(
        "Library {} has no {wanted:?} parent",
        library.id
    )))
}

fn shotgun_row(
    state: &LabState,
    lane: usize,
    library: &Composition,
    run: &SequencingRun,
) -> Result<ShotgunRow, LabError> {
    let container = state.container(library.container)?;
    let (plate, position) = container.well_position().ok_or_else(|| {
        LabError::state(format!("Library {} is not in a plate well", library.id))
    })?;
    let sample = originating_sample(state, library)?;
    let (i7_name, i7_index) = adapter(state, library, OligoRole::I7Adapter)?;
    let (i5_name, i5_index) = adapter(state, library, OligoRole::I5Adapter)?;
    Ok(ShotgunRow {
        lane,
        sample_id: sanitize_id(sample),
        plate: sanitize_id(&state.plate(plate)?.name),
        well: position.name(),
        i7_name: i7_name.to_string(),
        i7_index: i7_index.to_string(),
        i5_name: i5_name.to_string(),
        i5_index: i5_index.to_string(),
        project: sanitize_id(&run.run_name),
        description: sample.to_string(),
    })
}

/// One row per shotgun library in each pool; the lane is the pool's 1-based
/// position in the run.
pub fn shotgun_rows(state: &LabState, run: &SequencingRun) -> Result<Vec<ShotgunRow>, LabError> {
    let mut rows = Vec::new();
    for (idx, pool) in run.pools.iter().enumerate() {
        for library in state
            .trace_lineage(*pool)?
            .filter(|c| c.kind == CompositionKind::ShotgunLibrary)
        {
            rows.push(shotgun_row(state, idx + 1, library, run)?);
        }
    }
    Ok(rows
        .into_iter()
        .sorted_by(|a, b| (a.lane, &a.sample_id).cmp(&(b.lane, &b.sample_id)))
        .collect())
}

pub fn generate(state: &LabState, process: ProcessId) -> Result<String, LabError> {
    let process = state.process(process)?;
    let run = process.sequencing_run().ok_or_else(|| {
        LabError::validation(
            "process",
            format!(
                "Process {} is {}, not a sequencing run",
                process.id,
                process.kind_name()
            ),
        )
    })?;
    let assay = detect_assay(state, &run.pools)?;
    let pi = state.registry.user(run.principal_investigator)?;
    let contacts = run
        .contacts
        .iter()
        .map(|id| state.registry.user(*id))
        .collect::<Result<Vec<_>, _>>()?;
    let timestamp = process.timestamp;

    let mut lines = vec![
        format!("# PI,{},{}", pi.name, pi.email),
        format!("# Contact,{}", contacts.iter().map(|u| &u.name).join(",")),
        format!(
            "# Contact emails,{}",
            contacts.iter().map(|u| &u.email).join(",")
        ),
        "[Header]".to_string(),
        "IEMFileVersion,4".to_string(),
        format!("Investigator Name,{}", pi.name),
        format!(
            "Experiment Name,Run experiment {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.6f")
        ),
        format!("Date,{}", timestamp.format("%Y-%m-%d")),
        "Workflow,GenerateFASTQ".to_string(),
        "Application,FASTQ Only".to_string(),
        format!("Assay,{}", assay.as_str()),
        "Description,".to_string(),
        "Chemistry,Default".to_string(),
        String::new(),
        "[Reads]".to_string(),
        run.fwd_cycles.to_string(),
        run.rev_cycles.to_string(),
        String::new(),
        "[Settings]".to_string(),
        "ReverseComplement,0".to_string(),
        String::new(),
        "[Data]".to_string(),
    ];
    match assay {
        Assay::Amplicon => {
            lines.push(AMPLICON_DATA_HEADER.to_string());
            lines.push(format!(
                "{},,,,,{AMPLICON_BARCODE_PLACEHOLDER},,,,,",
                sanitize_id(&run.run_name)
            ));
        }
        Assay::Metagenomics => {
            lines.push(SHOTGUN_DATA_HEADER.to_string());
            lines.extend(shotgun_rows(state, run)?.iter().map(ShotgunRow::render));
        }
    }
    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{Engine, Operation},
        test_support::Lab,
    };
    use labtrack_protocol::ErrorCode;
    use regex::Regex;

    const AMPLICON_SHEET: &str = "\
# PI,Admin,admin@foo.bar
# Contact,Demo,Dude
# Contact emails,demo@microbio.me,test@foo.bar
[Header]
IEMFileVersion,4
Investigator Name,Admin
Experiment Name,Run experiment 2017-10-25 19:10:25.123456
Date,2017-10-25
Workflow,GenerateFASTQ
Application,FASTQ Only
Assay,Amplicon
Description,
Chemistry,Default

[Reads]
151
151

[Settings]
ReverseComplement,0

[Data]
Sample_ID,Sample_Name,Sample_Plate,Sample_Well,I7_Index_ID,index,Sample_Project,Description,,
Test_Run_1,,,,,NNNNNNNNNNNN,,,,,
";

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("1.SKB1.640202"), "1_SKB1_640202");
        assert_eq!(sanitize_id("Run-7 b/é"), "Run-7_b__");
    }

    #[test]
    fn test_amplicon_sheet() {
        let lab = Lab::new();
        let run = lab.amplicon_run();
        let state = lab.engine.snapshot();
        let sheet = generate(&state, run).unwrap();
        assert_eq!(sheet, AMPLICON_SHEET);
        assert_eq!(generate(&state, run).unwrap(), sheet);
    }

    #[test]
    fn test_live_run_timestamp_format() {
        let lab = Lab::new();
        let first = lab.amplicon_run();
        let state = lab.engine.snapshot();
        let pools = state.process(first).unwrap().sequencing_run().unwrap().pools.clone();
        let rerun = lab
            .engine
            .apply(
                lab.admin,
                Operation::Sequence {
                    run_name: "rerun".to_string(),
                    description: Some("same pool again".to_string()),
                    platform: lab.sequencer,
                    fwd_cycles: 101,
                    rev_cycles: 151,
                    principal_investigator: lab.admin,
                    contacts: vec![],
                    pools,
                },
            )
            .unwrap()
            .process_id
            .unwrap();
        let state = lab.engine.snapshot();
        let sheet = generate(&state, rerun).unwrap();
        let experiment =
            Regex::new(r"(?m)^Experiment Name,Run experiment \d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{6}$")
                .unwrap();
        assert!(experiment.is_match(&sheet));
        assert!(Regex::new(r"(?m)^Date,\d{4}-\d{2}-\d{2}$").unwrap().is_match(&sheet));
        assert!(sheet.contains("[Reads]\n101\n151\n"));
        assert!(sheet.contains("# Contact,\n# Contact emails,\n"));
        assert_eq!(generate(&state, rerun).unwrap(), sheet);
    }

    #[test]
    fn test_shotgun_sheet() {
        let lab = Lab::new();
        let run = lab.shotgun_run();
        let state = lab.engine.snapshot();
        let sheet = generate(&state, run).unwrap();
        assert!(sheet.contains("\nAssay,Metagenomics\n"));
        let data: Vec<&str> = sheet
            .split("[Data]\n")
            .nth(1)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(data[0], SHOTGUN_DATA_HEADER);
        assert_eq!(
            &data[1..],
            &[
                "1,1_SKB1_640202,1_SKB1_640202,Test_shotgun_library_plate,A1,iTru7_101_09,TGTACACC,iTru5_08_A,CATCTGCT,TestShotgunRun1,1.SKB1.640202",
                "1,1_SKB2_640194,1_SKB2_640194,Test_shotgun_library_plate,A2,iTru7_101_10,ACACGTGT,iTru5_08_B,ACGTACGA,TestShotgunRun1,1.SKB2.640194",
                "2,1_SKB3_640195,1_SKB3_640195,Test_shotgun_library_plate,B1,iTru7_101_11,GGTTAACC,iTru5_08_C,TCGATCGA,TestShotgunRun1,1.SKB3.640195",
                "2,blank_1_B2,blank_1_B2,Test_shotgun_library_plate,B2,iTru7_101_12,CCAATTGG,iTru5_08_D,GATCGATC,TestShotgunRun1,blank.1.B2",
            ]
        );
        assert!(sheet.ends_with("blank.1.B2\n"));
    }

    #[test]
    fn test_only_sequencing_runs_render() {
        let lab = Lab::new();
        let run = lab.amplicon_run();
        let state = lab.engine.snapshot();
        let err = generate(&state, run - 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(generate(&state, run + 100).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_mixed_assays_are_rejected() {
        let lab = Lab::new();
        let amplicon = lab.amplicon_run();
        let shotgun = lab.shotgun_run();
        let state = lab.engine.snapshot();
        let pools: Vec<_> = [amplicon, shotgun]
            .iter()
            .flat_map(|p| state.process(*p).unwrap().sequencing_run().unwrap().pools.clone())
            .collect();
        let before = state.processes.len();
        let err = lab
            .try_run(Operation::Sequence {
                run_name: "mixed".to_string(),
                description: None,
                platform: lab.sequencer,
                fwd_cycles: 151,
                rev_cycles: 151,
                principal_investigator: lab.admin,
                contacts: vec![],
                pools,
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.field.as_deref(), Some("pools"));
        assert_eq!(lab.engine.snapshot().processes.len(), before);
    }

    #[test]
    fn test_sheet_fields_reject_separators() {
        assert!(check_sheet_field("sample_id", "1.SKB1.640202").is_ok());
        let err = check_sheet_field("sample_id", "a,b").unwrap_err();
        assert_eq!(err.field.as_deref(), Some("sample_id"));
        assert!(check_sheet_field("name", "two\nlines").is_err());
    }
}
