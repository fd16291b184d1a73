use anyhow::{anyhow, bail, Context, Result};
use labtrack::{
    about,
    engine::{Engine, LabEngine, Operation, Workflow},
    lineage_export,
    plate::PlateLayoutSummary,
    sample_sheet,
    store::{EngineParameters, LabState},
};
use labtrack_protocol::{ContainerId, PlateId, ProcessId, UserId};
use serde::Serialize;
use std::{env, fs};

const DEFAULT_STATE_PATH: &str = ".labtrack_state.json";

#[derive(Serialize)]
struct ProcessSummary {
    id: ProcessId,
    kind: &'static str,
    timestamp: String,
    operator: UserId,
    produced: usize,
}

#[derive(Serialize)]
struct StateSummary {
    container_count: usize,
    composition_count: usize,
    plate_count: usize,
    user_count: usize,
    equipment_count: usize,
    reagent_count: usize,
    processes: Vec<ProcessSummary>,
    parameters: EngineParameters,
}

#[derive(Serialize)]
struct PlateLayout {
    id: PlateId,
    name: String,
    summary: PlateLayoutSummary,
    layout: Vec<Vec<Option<ContainerId>>>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  labtrack_cli --version\n  \
  labtrack_cli capabilities\n  \
  labtrack_cli [--state PATH] [--operator USER_ID] op '<operation-json>'\n  \
  labtrack_cli [--state PATH] workflow '<workflow-json>'\n  \
  labtrack_cli [--state PATH] state-summary\n  \
  labtrack_cli [--state PATH] plate-layout PLATE_ID\n  \
  labtrack_cli [--state PATH] lineage COMPOSITION_ID\n  \
  labtrack_cli [--state PATH] sample-sheet PROCESS_ID [OUTPUT]\n  \
  labtrack_cli [--state PATH] export-lineage OUTPUT.csv\n\n  \
  Process operations need --operator with an existing user id; registry\n  \
  operations such as CreateUser run without it.\n  \
  Tip: pass @file.json instead of inline JSON"
    );
}

fn load_json_arg(value: &str) -> Result<String> {
    if let Some(path) = value.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
    } else {
        Ok(value.to_string())
    }
}

fn load_state(path: &str) -> Result<LabState> {
    if std::path::Path::new(path).exists() {
        Ok(LabState::load_from_path(path)?)
    } else {
        Ok(LabState::default())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text =
        serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

struct GlobalArgs {
    state_path: String,
    operator: Option<UserId>,
    cmd_idx: usize,
}

fn parse_global_args(args: &[String]) -> Result<GlobalArgs> {
    let mut global = GlobalArgs {
        state_path: DEFAULT_STATE_PATH.to_string(),
        operator: None,
        cmd_idx: 1,
    };
    while global.cmd_idx + 1 < args.len() {
        match args[global.cmd_idx].as_str() {
            "--state" => global.state_path = args[global.cmd_idx + 1].clone(),
            "--operator" => {
                let raw = &args[global.cmd_idx + 1];
                global.operator = Some(
                    raw.parse()
                        .with_context(|| format!("Invalid operator id '{raw}'"))?,
                );
            }
            _ => break,
        }
        global.cmd_idx += 2;
    }
    Ok(global)
}

fn id_arg(args: &[String], idx: usize, what: &str) -> Result<u64> {
    let Some(raw) = args.get(idx) else {
        usage();
        bail!("Missing {what}");
    };
    raw.parse()
        .with_context(|| format!("Invalid {what} '{raw}'"))
}

fn summarize_state(state: &LabState) -> StateSummary {
    StateSummary {
        container_count: state.containers.len(),
        composition_count: state.compositions.len(),
        plate_count: state.plates.len(),
        user_count: state.registry.users.len(),
        equipment_count: state.registry.equipment.len(),
        reagent_count: state.registry.reagents.len(),
        processes: state
            .processes
            .values()
            .map(|p| ProcessSummary {
                id: p.id,
                kind: p.kind_name(),
                timestamp: p.timestamp.to_rfc3339(),
                operator: p.operator,
                produced: p.produced.len(),
            })
            .collect(),
        parameters: state.parameters.clone(),
    }
}

fn save(engine: &LabEngine, state_path: &str) -> Result<()> {
    engine.snapshot().save_to_path(state_path)?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }

    let GlobalArgs {
        state_path,
        operator,
        cmd_idx,
    } = parse_global_args(&args)?;
    let Some(command) = args.get(cmd_idx) else {
        usage();
        bail!("Missing command");
    };

    match command.as_str() {
        "capabilities" => print_json(&LabEngine::capabilities()),
        "state-summary" => print_json(&summarize_state(&load_state(&state_path)?)),
        "op" => {
            let Some(raw) = args.get(cmd_idx + 1) else {
                usage();
                bail!("Missing operation JSON");
            };
            let op: Operation = serde_json::from_str(&load_json_arg(raw)?)
                .context("Invalid operation JSON")?;
            let engine = LabEngine::from_state(load_state(&state_path)?);
            let result = match operator {
                Some(operator) => engine.apply(operator, op)?,
                None => engine
                    .apply(0, op)
                    .context("No --operator given; process operations need an existing user id")?,
            };
            save(&engine, &state_path)?;
            print_json(&result)
        }
        "workflow" => {
            let Some(raw) = args.get(cmd_idx + 1) else {
                usage();
                bail!("Missing workflow JSON");
            };
            let workflow: Workflow = serde_json::from_str(&load_json_arg(raw)?)
                .context("Invalid workflow JSON")?;
            let engine = LabEngine::from_state(load_state(&state_path)?);
            // Operations are committed one by one; keep what succeeded.
            let outcome = engine.apply_workflow(workflow);
            save(&engine, &state_path)?;
            print_json(&outcome?)
        }
        "plate-layout" => {
            let id = id_arg(&args, cmd_idx + 1, "plate id")?;
            let state = load_state(&state_path)?;
            let plate = state.plate(id)?;
            print_json(&PlateLayout {
                id,
                name: plate.name.clone(),
                summary: plate.layout_summary(),
                layout: plate.layout(),
            })
        }
        "lineage" => {
            let id = id_arg(&args, cmd_idx + 1, "composition id")?;
            let state = load_state(&state_path)?;
            print_json(&lineage_export::lineage_rows_for(&state, id)?)
        }
        "sample-sheet" => {
            let id = id_arg(&args, cmd_idx + 1, "process id")?;
            let state = load_state(&state_path)?;
            let sheet = sample_sheet::generate(&state, id)?;
            match args.get(cmd_idx + 2) {
                Some(output) => {
                    fs::write(output, &sheet)
                        .with_context(|| format!("Could not write sample sheet '{output}'"))?;
                    println!("Wrote sample sheet for process {id} to '{output}'");
                }
                None => print!("{sheet}"),
            }
            Ok(())
        }
        "export-lineage" => {
            let output = args
                .get(cmd_idx + 1)
                .ok_or_else(|| anyhow!("export-lineage requires OUTPUT.csv"))?;
            let state = load_state(&state_path)?;
            let rows = lineage_export::export_lineage_csv(&state, output)?;
            println!("Wrote {rows} lineage edge(s) to '{output}'");
            Ok(())
        }
        _ => {
            usage();
            bail!("Unknown command '{command}'")
        }
    }
}
