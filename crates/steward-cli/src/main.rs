//! CLI binary for running and validating Steward resource graphs.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use steward_engine::{
    default_registry, validate_graph, Engine, EngineConfig, GraphFile, ResourceGraph,
    ResourceRegistry,
};

mod signals;

#[derive(Parser)]
#[command(name = "steward", version, about = "Keeps a graph of resources converged")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a resource graph until interrupted. SIGHUP reloads the file.
    Run {
        /// Path to the graph .json file
        graph: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        /// Print engine events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Validate a graph file without running it
    Validate {
        /// Path to the graph .json file
        graph: PathBuf,
    },

    /// Show the resources, edges and run order of a graph file
    Info {
        /// Path to the graph .json file
        graph: PathBuf,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Root directory for on-disk state
    #[arg(long, default_value = "/var/lib/steward")]
    prefix: PathBuf,

    /// Hostname handed to resources (default: $HOSTNAME, then "localhost")
    #[arg(long)]
    hostname: Option<String>,

    /// Program name handed to resources
    #[arg(long, default_value = "steward")]
    program: String,

    /// JSON engine config; overrides the flags above
    #[arg(long)]
    config: Option<PathBuf>,
}

impl EngineArgs {
    fn engine_config(&self, debug: bool) -> anyhow::Result<EngineConfig> {
        if let Some(path) = &self.config {
            return EngineConfig::load(path)
                .with_context(|| format!("reading config {}", path.display()));
        }
        let hostname = self
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());
        Ok(
            EngineConfig::new(self.program.clone(), hostname, self.prefix.clone())
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_debug(debug),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            graph,
            engine,
            events,
        } => {
            let config = engine.engine_config(cli.verbose)?;
            cmd_run(&graph, config, events).await?;
        }
        Commands::Validate { graph } => {
            cmd_validate(&graph)?;
        }
        Commands::Info { graph } => {
            cmd_info(&graph)?;
        }
    }

    Ok(())
}

fn load_graph(path: &Path, registry: &ResourceRegistry) -> anyhow::Result<ResourceGraph> {
    let file = GraphFile::load(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(file.build(registry)?)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path, &default_registry())?;
    if let Err(e) = validate_graph(&graph) {
        println!("[ERROR] {e}");
        std::process::exit(1);
    }
    println!("Graph is valid");
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path, &default_registry())?;

    println!("Graph: {}", graph.name());
    println!("Resources: {}", graph.num_vertices());
    println!("Edges: {}", graph.num_edges());

    println!("\nResources:");
    for (_, res) in graph.vertices() {
        let meta = res.meta_params();
        println!(
            "  {} retry={} poll={} noop={} hidden={}",
            res, meta.retry, meta.poll, meta.noop, meta.hidden
        );
    }

    if graph.num_edges() > 0 {
        println!("\nEdges:");
        for (from, to, edge) in graph.edges() {
            if let (Some(from), Some(to)) = (graph.vertex(from), graph.vertex(to)) {
                let notify = if edge.notify { " (notify)" } else { "" };
                println!("  {from} -> {to}{notify}");
            }
        }
    }

    println!("\nOrder:");
    for (i, id) in graph.topological_sort()?.into_iter().enumerate() {
        if let Some(res) = graph.vertex(id) {
            println!("  {}. {}", i + 1, res);
        }
    }

    Ok(())
}

/// Stage `graph`, validate and commit it. The candidate is discarded if
/// either step fails, leaving the running graph in place.
async fn swap_graph(engine: &mut Engine, graph: ResourceGraph) -> anyhow::Result<()> {
    engine.load(graph)?;
    let committed = match engine.validate() {
        Ok(()) => engine.commit().await,
        Err(e) => Err(e),
    };
    if let Err(e) = committed {
        engine.abort()?;
        return Err(e.into());
    }
    Ok(())
}

/// Pause, swap in the re-read graph and resume. Workers are always resumed,
/// even when pausing or swapping failed part way.
async fn reload(engine: &mut Engine, path: &Path, registry: &ResourceRegistry) -> anyhow::Result<()> {
    let graph = load_graph(path, registry)?;
    let swapped = match engine.pause(false).await {
        Ok(()) => swap_graph(engine, graph).await,
        Err(e) => Err(anyhow::Error::from(e).context("pause")),
    };
    match engine.resume() {
        Ok(()) => {}
        Err(e) if e.is_state_mismatch() => {}
        Err(e) => warn!(error = %e, "resume after reload failed"),
    }
    swapped
}

async fn cmd_run(path: &Path, config: EngineConfig, events: bool) -> anyhow::Result<()> {
    let registry = default_registry();
    let mut engine = Engine::init(config)?;

    if events {
        let mut rx = engine.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "could not encode event"),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let graph = load_graph(path, &registry)?;
    if let Err(e) = swap_graph(&mut engine, graph).await {
        if let Err(shutdown) = engine.shutdown().await {
            warn!(error = %shutdown, "shutdown after failed start");
        }
        return Err(e);
    }
    engine.resume()?;
    info!(graph = %path.display(), resources = engine.graph().num_vertices(), "running");

    let mut hangups = signals::Hangups::new()?;
    let shutdown = signals::wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            received = &mut shutdown => {
                received?;
                info!("shutdown signal received");
                break;
            }
            _ = hangups.recv() => {
                info!(graph = %path.display(), "reloading");
                match reload(&mut engine, path, &registry).await {
                    Ok(()) => info!(resources = engine.graph().num_vertices(), "reloaded"),
                    Err(e) => warn!(error = %e, "reload failed, keeping the running graph"),
                }
            }
        }
    }

    engine.shutdown().await.context("shutdown")?;
    Ok(())
}
