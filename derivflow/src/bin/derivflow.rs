//! derivflow CLI: inspect pipelines and recorded runs.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derivflow::api::get_status;
use derivflow::config::EngineConfig;
use derivflow::errors::DerivflowError;
use derivflow::pipeline::{PipelineDefinition, PipelineGraph};
use derivflow::recorder::RunRecorder;
use derivflow::store::{JsonFileManifestStore, JsonFileResumeStore, RunKey};

#[derive(Parser)]
#[command(name = "derivflow")]
#[command(about = "Incremental per-subject pipeline runs")]
#[command(version)]
struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition and print its execution order
    Plan {
        /// Path to the pipeline definition
        definition: PathBuf,
    },

    /// Print per-subject status of a run
    Status {
        /// Project id
        #[arg(long)]
        project: String,

        /// Run id
        #[arg(long)]
        run: String,

        /// Only show this subject file
        #[arg(long)]
        subject: Option<PathBuf>,
    },

    /// Dump a node's resume index
    ResumeIndex {
        /// Project id
        #[arg(long)]
        project: String,

        /// Run id
        #[arg(long)]
        run: String,

        /// Node id
        #[arg(long)]
        node: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<(), DerivflowError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::new().with_env_overrides(),
    };

    match cli.command {
        Commands::Plan { definition } => plan(&definition),
        Commands::Status { project, run, subject } => {
            let recorder = recorder(&config);
            let status = get_status(&recorder, &RunKey::new(project, run), subject.as_deref()).await?;
            print_json(&status)
        }
        Commands::ResumeIndex { project, run, node } => {
            let recorder = recorder(&config);
            let key = RunKey::new(project, run);
            match recorder.resume_index(&key, &node).await? {
                Some(index) => print_json(&index),
                None => {
                    eprintln!("No resume index for node '{node}' in run {key}");
                    Ok(())
                }
            }
        }
    }
}

fn plan(path: &Path) -> Result<(), DerivflowError> {
    let definition = PipelineDefinition::from_file(path)?;
    let graph = PipelineGraph::build(definition)?;
    println!("Pipeline '{}'", graph.definition().name);
    for (step, node_id) in graph.execution_order().iter().enumerate() {
        let node = graph.node(node_id)?;
        if node.upstream.is_empty() {
            println!("{:>3}. {} [{}]", step + 1, node.id, node.kind);
        } else {
            println!("{:>3}. {} [{}] <- {}", step + 1, node.id, node.kind, node.upstream.join(", "));
        }
    }
    Ok(())
}

fn recorder(config: &EngineConfig) -> RunRecorder {
    RunRecorder::new(
        Arc::new(JsonFileManifestStore::new(&config.workspace_dir)),
        Arc::new(JsonFileResumeStore::new(&config.workspace_dir)),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), DerivflowError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
