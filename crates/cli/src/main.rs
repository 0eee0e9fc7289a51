//! `graphflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a graph JSON file and print its execution layers.
//! - `plan`: print the nodes the next run would execute.
//! - `run`: execute the graph with every task bound to `echo`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    Graph, HandlerRegistry, JsonFileSnapshotStore, Orchestrator, OrchestratorConfig, RunRequest,
};
use nodes::builtin::ECHO;
use nodes::HandlerInputs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "graphflow",
    about = "Incremental, layer-parallel graph workflow runner",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the graph JSON file.
    path: PathBuf,
    /// JSON object delivered to entry nodes.
    #[arg(long, default_value = "{}")]
    inputs: String,
    /// Directory holding one snapshot file per graph.
    #[arg(long, env = "GRAPHFLOW_SNAPSHOT_DIR", default_value = ".graphflow/snapshots")]
    snapshot_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a graph definition JSON file.
    Validate {
        /// Path to the graph JSON file.
        path: PathBuf,
    },
    /// Show which nodes would execute, without executing anything.
    Plan {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Execute the graph and print the run report as JSON.
    Run {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        /// Maximum nodes executing at once (default: whole layer).
        #[arg(long)]
        max_parallelism: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let graph = load_graph(&path)?;
            match engine::execution_layers(&graph) {
                Ok(layers) => {
                    println!("Graph '{}' is valid. Execution layers:", graph.id);
                    for layer in layers {
                        println!("  {}: {}", layer.index, layer.nodes.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Plan { args } => {
            let graph = echo_bound(load_graph(&args.path)?);
            let inputs = parse_inputs(&args.inputs)?;
            let orchestrator = build(&args.snapshot_dir, OrchestratorConfig::default());

            let plan = orchestrator
                .plan(&graph, &inputs)
                .await
                .context("failed to plan run")?;
            let affected: Vec<&String> = plan.affected.iter().collect();
            println!("{}", serde_json::to_string_pretty(&affected)?);
        }
        Command::Run {
            args,
            max_retries,
            poll_interval_ms,
            max_parallelism,
        } => {
            let graph = echo_bound(load_graph(&args.path)?);
            let inputs = parse_inputs(&args.inputs)?;

            let mut config = OrchestratorConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                max_parallelism,
                ..OrchestratorConfig::default()
            };
            config.retry.max_retries = max_retries;
            let orchestrator = build(&args.snapshot_dir, config);

            let token = CancellationToken::new();
            let on_interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_interrupt.cancel();
                }
            });

            info!(graph_id = %graph.id, snapshot_dir = %args.snapshot_dir.display(), "running graph");
            let report = orchestrator
                .run(&graph, RunRequest::new(inputs).with_cancellation(token))
                .await
                .context("run aborted")?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> Result<Graph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid graph JSON in {}", path.display()))
}

fn parse_inputs(raw: &str) -> Result<HandlerInputs> {
    serde_json::from_str(raw).context("--inputs must be a JSON object")
}

/// The CLI ships no domain handlers, so every task runs `echo`.
fn echo_bound(mut graph: Graph) -> Graph {
    for node in graph.nodes.iter_mut().filter(|n| !n.is_structural()) {
        node.handler = Some(ECHO.to_owned());
    }
    graph
}

fn build(snapshot_dir: &Path, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(
        HandlerRegistry::with_builtins(),
        Arc::new(JsonFileSnapshotStore::new(snapshot_dir)),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::Node;

    #[test]
    fn every_task_is_rebound_to_echo() {
        let graph = Graph::new("g")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "custom"));
        let bound = echo_bound(graph);
        assert_eq!(bound.nodes[0].handler, None);
        assert_eq!(bound.nodes[1].handler.as_deref(), Some(ECHO));
    }

    #[test]
    fn inputs_must_be_an_object() {
        assert_eq!(parse_inputs(r#"{"x": 1}"#).unwrap().get::<i64>("x").unwrap(), 1);
        assert!(parse_inputs("[1, 2]").is_err());
    }
}
