//! TRIALFLOW CLI
//!
//! Inspect, compile, and play experiment snapshots from the terminal.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod console;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use indexmap::IndexMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use trialflow_core::Millis;
use trialflow_plan::{CompileOptions, Compiler, CompilerOutput, DurationPolicy, Graph};
use trialflow_runtime::{spawn_session, EngineConfig, PlaybackEngine, ResponseEvent, SessionCommand};
use trialflow_storage::{load_snapshot, ExperimentSnapshot};

#[derive(Parser)]
#[command(name = "trialflow")]
#[command(about = "TRIALFLOW - Experiment graph compiler and trial runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize an experiment file
    Inspect {
        /// Snapshot file
        file: PathBuf,
    },
    /// Print the compiled timeline
    Compile {
        /// Snapshot file
        file: PathBuf,
        #[command(flatten)]
        compile: CompileArgs,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Play an experiment headlessly, reading operator commands from stdin
    Run {
        /// Snapshot file
        file: PathBuf,
        #[command(flatten)]
        compile: CompileArgs,
        /// Default duration of an instruction step, in milliseconds
        #[arg(long, default_value_t = 3000)]
        instruction_default_ms: u64,
        /// Shortest timed step, in milliseconds
        #[arg(long, default_value_t = 1000)]
        min_step_ms: u64,
        /// Write the session report here as well as to stdout
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CompileArgs {
    /// Seed for loop shuffles; random when omitted
    #[arg(long)]
    seed: Option<u64>,
    /// Most repetitions any one loop expands to
    #[arg(long, default_value_t = CompileOptions::DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,
}

impl CompileArgs {
    fn options(&self) -> CompileOptions {
        let options = CompileOptions::new().with_max_iterations(self.max_iterations);
        match self.seed {
            Some(seed) => options.with_shuffle_seed(seed),
            None => options,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trialflow=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file } => inspect(&file),
        Commands::Compile { file, compile, json } => print_timeline(&file, &compile, json),
        Commands::Run {
            file,
            compile,
            instruction_default_ms,
            min_step_ms,
            report,
        } => {
            let durations = DurationPolicy::new()
                .with_instruction_default(Millis::new(instruction_default_ms))
                .with_floor(Millis::new(min_step_ms));
            let config = EngineConfig::new()
                .with_durations(durations)
                .with_compile_options(compile.options());
            run(&file, config, report.as_deref()).await
        }
    }
}

fn open(file: &Path) -> Result<(ExperimentSnapshot, Graph)> {
    let snapshot = load_snapshot(file).wrap_err_with(|| format!("loading {}", file.display()))?;
    let graph = snapshot.to_graph()?;
    Ok((snapshot, graph))
}

fn inspect(file: &Path) -> Result<()> {
    let (snapshot, graph) = open(file)?;

    let mut kinds: IndexMap<String, usize> = IndexMap::new();
    for node in graph.nodes() {
        *kinds.entry(node.kind().type_name().to_string()).or_default() += 1;
    }

    println!("file:        {}", file.display());
    println!("version:     {}", snapshot.version);
    println!("saved:       {}", snapshot.timestamp);
    println!("background:  {}", snapshot.runner_background_color);
    println!("nodes:       {}", graph.node_count());
    for (kind, count) in &kinds {
        println!("  {:<11}{}", kind, count);
    }
    println!("edges:       {}", graph.edge_count());

    let output = Compiler::new().compile_graph(&graph);
    println!("steps:       {}", output.timeline.len());
    for warning in &output.warnings {
        println!("warning:     {}", warning);
    }
    Ok(())
}

fn print_timeline(file: &Path, args: &CompileArgs, as_json: bool) -> Result<()> {
    let (_, graph) = open(file)?;
    let CompilerOutput { timeline, warnings } = Compiler::with_options(args.options()).compile_graph(&graph);
    let durations = DurationPolicy::new();

    if as_json {
        let steps: Vec<_> = timeline
            .steps()
            .iter()
            .enumerate()
            .map(|(index, step)| {
                json!({
                    "index": index,
                    "origin": step.origin,
                    "nodes": step.node_ids(),
                    "duration": durations.step_duration(step),
                })
            })
            .collect();
        let warnings: Vec<String> = warnings.iter().map(ToString::to_string).collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "steps": steps, "warnings": warnings }))?);
        return Ok(());
    }

    for (index, step) in timeline.steps().iter().enumerate() {
        let ids: Vec<String> = step.node_ids().iter().map(|id| id.as_str().to_string()).collect();
        let duration = match durations.step_duration(step) {
            Some(millis) => millis.to_string(),
            None => "untimed".to_string(),
        };
        println!("{:>3}  [{}]  {}", index, duration, ids.join(", "));
    }
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

async fn run(file: &Path, config: EngineConfig, report_path: Option<&Path>) -> Result<()> {
    let (_, graph) = open(file)?;
    let output = Compiler::with_options(config.compile).compile_graph(&graph);
    tracing::info!(steps = output.timeline.len(), warnings = output.warnings.len(), "timeline compiled");

    let engine = PlaybackEngine::new(config).with_response_sink(|event: &ResponseEvent| {
        tracing::info!(node = %event.node_id, elapsed = %event.elapsed_time, value = %event.value, "response");
    });
    let mut handle = spawn_session(engine, output.timeline)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if let Some(command) = console::parse_line(&line) {
                            let stopping = command == SessionCommand::Stop;
                            if handle.send(command).is_err() || stopping {
                                stdin_open = false;
                            }
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }

    let Some(report) = handle.join().await? else {
        return Ok(());
    };
    let text = serde_json::to_string_pretty(&report)?;
    println!("{}", text);
    if let Some(path) = report_path {
        std::fs::write(path, &text).wrap_err_with(|| format!("writing report to {}", path.display()))?;
    }
    Ok(())
}
