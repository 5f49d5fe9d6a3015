//! loopnet command line.
//!
//! `loopnet run` compiles a JSON topology, binds JSON inputs, executes it
//! once and prints the requested outputs as JSON. `loopnet inspect` prints
//! the compiled program: processing order, layouts and loop mappings.
//!
//! Exit codes: 0 = success, 1 = compile error, 2 = execution error,
//! 3 = I/O or parse error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;

use loopnet_core::{DataType, Layout, MemoryView, TensorValues, Topology};
use loopnet_runtime::{Engine, Network, Program, ReferenceSelector, RuntimeConfig};

/// Recurrent graph compiler and runner.
#[derive(Parser)]
#[command(name = "loopnet", about = "Compile and run loopnet topologies")]
struct Cli {
    /// Log level: -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a topology once.
    Run {
        /// Topology JSON file.
        #[arg(short, long)]
        topology: PathBuf,

        /// Input tensors: `{ "id": { "shape": [...], "values": [...] } }`.
        #[arg(short, long)]
        inputs: Option<PathBuf>,

        /// Runtime configuration JSON file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output to print; repeatable (default: every loop output).
        #[arg(short, long)]
        output: Vec<String>,
    },
    /// Print the compiled form of a topology.
    Inspect {
        /// Topology JSON file.
        #[arg(short, long)]
        topology: PathBuf,

        /// Runtime configuration JSON file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// One input tensor as read from the inputs file.
#[derive(Debug, Deserialize)]
struct TensorInput {
    shape: Vec<usize>,
    values: TensorValues,
}

/// One output tensor as printed.
#[derive(Debug, Serialize)]
struct TensorOutput {
    data_type: DataType,
    shape: Vec<usize>,
    values: TensorValues,
}

/// Failure of one subcommand, carrying its exit code.
enum Failure {
    Compile(String),
    Execution(String),
    Io(String),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Compile(_) => 1,
            Failure::Execution(_) => 2,
            Failure::Io(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Compile(msg) | Failure::Execution(msg) | Failure::Io(msg) => msg,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            topology,
            inputs,
            config,
            output,
        } => run(&topology, inputs.as_deref(), config.as_deref(), &output),
        Commands::Inspect { topology, config } => inspect(&topology, config.as_deref()),
    };

    match result {
        Ok(json) => println!("{}", json),
        Err(failure) => {
            eprintln!("Error: {}", failure.message());
            process::exit(failure.exit_code());
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T, Failure> {
    let text = fs::read_to_string(path)
        .map_err(|e| Failure::Io(format!("failed to read {} '{}': {}", what, path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Failure::Io(format!("failed to parse {} '{}': {}", what, path.display(), e)))
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, Failure> {
    match path {
        Some(path) => read_json(path, "config"),
        None => Ok(RuntimeConfig::default()),
    }
}

fn compile(topology: &Path, config: &RuntimeConfig) -> Result<Program, Failure> {
    let topology: Topology = read_json(topology, "topology")?;
    Program::compile(&topology, Arc::new(ReferenceSelector), &config.compile)
        .map_err(|e| Failure::Compile(e.to_string()))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn run(
    topology: &Path,
    inputs: Option<&Path>,
    config: Option<&Path>,
    outputs: &[String],
) -> Result<String, Failure> {
    let config = load_config(config)?;
    let program = compile(topology, &config)?;
    let inputs: BTreeMap<String, TensorInput> = match inputs {
        Some(path) => read_json(path, "inputs")?,
        None => BTreeMap::new(),
    };

    let engine = Arc::new(Engine::new(config.engine.clone()));
    let mut network = Network::new(&program, engine, config.network.clone())
        .map_err(|e| Failure::Execution(e.to_string()))?;

    for (id, tensor) in &inputs {
        let data_type = program
            .layout(id)
            .map(|layout| layout.data_type)
            .ok_or_else(|| Failure::Io(format!("input '{}' is not a primitive of the topology", id)))?;
        let view = MemoryView::allocate(Layout::new(data_type, &tensor.shape));
        view.fill(&tensor.values)
            .map_err(|e| Failure::Io(format!("input '{}': {}", id, e)))?;
        network
            .set_input_data(id, view)
            .map_err(|e| Failure::Execution(e.to_string()))?;
    }

    network.run().map_err(|e| Failure::Execution(e.to_string()))?;

    let requested: Vec<String> = if outputs.is_empty() {
        program
            .loop_nodes()
            .flat_map(|node| node.output_ids.iter().map(|id| id.to_string()))
            .collect()
    } else {
        outputs.to_vec()
    };

    let mut printed = BTreeMap::new();
    for id in requested {
        let view = network
            .get_output(&id)
            .map_err(|e| Failure::Execution(e.to_string()))?;
        printed.insert(id, tensor_output(&view));
    }
    serde_json::to_string_pretty(&printed).map_err(|e| Failure::Io(e.to_string()))
}

fn tensor_output(view: &MemoryView) -> TensorOutput {
    let layout = view.layout();
    let values = if layout.data_type.is_float() {
        TensorValues::Float(view.to_f64_vec())
    } else if layout.data_type.is_bool() {
        TensorValues::Bool(view.to_scalars().into_iter().map(|s| s.is_truthy()).collect())
    } else {
        TensorValues::Int(view.to_i64_vec())
    };
    TensorOutput {
        data_type: layout.data_type,
        shape: layout.shape.to_vec(),
        values,
    }
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

fn inspect(topology: &Path, config: Option<&Path>) -> Result<String, Failure> {
    let config = load_config(config)?;
    let program = compile(topology, &config)?;

    let order: Vec<serde_json::Value> = program
        .processing_order()
        .iter()
        .filter_map(|&node_id| {
            let node = program.graph().node(node_id)?;
            let compiled = program.compiled(node_id)?;
            Some(json!({
                "id": node.id,
                "op": node.op.name(),
                "inputs": node.inputs,
                "outputs": node.outputs,
                "layouts": compiled.layouts.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
            }))
        })
        .collect();

    let loops: Vec<serde_json::Value> = program
        .loop_nodes()
        .map(|node| {
            json!({
                "id": node.id,
                "max_iteration": node.max_iteration(),
                "trip_count": node.desc.trip_count,
                "initial_condition": node.desc.initial_condition,
                "input_mappings": node.desc.input_mappings,
                "output_mappings": node.desc.output_mappings,
                "back_edges": node.desc.back_edges,
                "current_iteration_id": node.desc.current_iteration_id,
                "condition_id": node.desc.condition_id,
                "num_iterations_id": node.desc.num_iterations_id,
                "body_primitives": node.body.processing_order().len(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json!({ "order": order, "loops": loops }))
        .map_err(|e| Failure::Io(e.to_string()))
}
