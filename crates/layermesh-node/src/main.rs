//! layermesh node binary.
//!
//! ```bash
//! # Coordinator on the GPU box, planning with a profiling run
//! RUST_LOG=info layermesh-node coordinator --listen 0.0.0.0:8081 \
//!     --device-type gpu --compute-score 100 --memory-gb 24 --profile gpt2.jsonl
//!
//! # Worker on a CPU box
//! RUST_LOG=info layermesh-node worker --listen 0.0.0.0:8082 \
//!     --advertise 10.0.0.7:8082 --coordinator 10.0.0.2:8081
//!
//! # Offline what-if plan
//! layermesh-node plan --nodes nodes.json --strategy latency
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use layermesh_net::{serve, StageClient};
use layermesh_pipeline::{Coordinator, HardwareProbe, PassthroughEngine, StageWorker, SystemProbe};
use layermesh_planner::{load_plan, save_plan, synthetic_layer_costs, ExecutionPlanner, MetricsCollector, ProcMemory};
use layermesh_types::config::{CoordinatorConfig, LocalNodeConfig, NetConfig, PlannerConfig, WorkerConfig};
use layermesh_types::{DeviceType, LayerCost, NodeDescriptor, PartitionStrategy};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "layermesh-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "layermesh: pipeline inference across heterogeneous nodes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a coordinator (optionally executing its own stages).
    Coordinator(CoordinatorArgs),

    /// Run a stage worker.
    Worker(WorkerArgs),

    /// Generate a plan offline and print it.
    Plan(PlanArgs),

    /// Ping a node.
    Ping {
        #[arg(long, default_value = "127.0.0.1:8081")]
        addr: String,
        #[arg(long, default_value = "ping")]
        message: String,
    },

    /// Print a node's health report.
    Health {
        #[arg(long, default_value = "127.0.0.1:8081")]
        addr: String,
    },

    /// Query the coordinator's central metrics.
    Metrics {
        #[arg(long, default_value = "127.0.0.1:8081")]
        addr: String,
        /// Only records from this node.
        #[arg(long)]
        source: Option<String>,
    },
}

/// Local hardware overrides shared by `coordinator` and `worker`.
#[derive(Args)]
struct NodeArgs {
    #[arg(long)]
    node_id: Option<String>,
    /// cpu, gpu or igpu. Probes the host when omitted.
    #[arg(long)]
    device_type: Option<DeviceType>,
    #[arg(long)]
    compute_score: Option<f64>,
    #[arg(long)]
    memory_gb: Option<f64>,
    #[arg(long)]
    fp16: Option<bool>,
}

impl NodeArgs {
    fn apply(&self, node: &mut LocalNodeConfig) {
        if let Some(id) = &self.node_id {
            node.node_id = id.clone();
        }
        node.device_type = self.device_type.or(node.device_type);
        node.compute_score = self.compute_score.or(node.compute_score);
        node.memory_gb = self.memory_gb.or(node.memory_gb);
        node.has_fp16 = self.fp16.or(node.has_fp16);
    }
}

#[derive(Args)]
struct CoordinatorArgs {
    /// JSON config file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    /// Address workers use to reach this node. Defaults to the bound address.
    #[arg(long)]
    advertise: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    strategy: Option<PartitionStrategy>,
    /// JSONL metrics from a profiling run.
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Activate this saved plan at startup.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Coordinate only; never run stages here.
    #[arg(long)]
    no_participate: bool,
    #[command(flatten)]
    node: NodeArgs,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    advertise: Option<String>,
    /// Coordinator to register with.
    #[arg(long)]
    coordinator: Option<String>,
    #[arg(long)]
    max_sessions: Option<u32>,
    #[command(flatten)]
    node: NodeArgs,
}

#[derive(Args)]
struct PlanArgs {
    /// JSON array of node descriptors.
    #[arg(long)]
    nodes: PathBuf,
    /// JSONL metrics from a profiling run. Uses the synthetic profile when omitted.
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long, default_value = "balanced")]
    strategy: PartitionStrategy,
    #[arg(long, default_value = "model")]
    model: String,
    /// Write the plan as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=layermesh_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args)       => run_coordinator(args).await,
        Command::Worker(args)            => run_worker(args).await,
        Command::Plan(args)              => run_plan(args),
        Command::Ping { addr, message }  => {
            let pong = StageClient::new(addr, NetConfig::default()).ping(&message).await?;
            println!("{} ({}, {})", pong.message, pong.node_version, pong.timestamp);
            Ok(())
        }
        Command::Health { addr } => {
            let health = StageClient::new(addr, NetConfig::default()).health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Command::Metrics { addr, source } => {
            let report = StageClient::new(addr, NetConfig::default()).query_metrics(source).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

// ── Config helpers ────────────────────────────────────────────────────────────

fn read_config<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

fn load_profile(path: Option<&Path>) -> Result<Vec<LayerCost>> {
    let Some(path) = path else {
        info!("no profile given, planning with the synthetic 26-layer profile");
        return Ok(synthetic_layer_costs());
    };
    let mut collector = MetricsCollector::new(Box::new(ProcMemory));
    collector
        .import_jsonl(path)
        .with_context(|| format!("loading profile {}", path.display()))?;
    let layers = collector.layer_costs();
    if layers.is_empty() {
        bail!("profile {} holds no layer records", path.display());
    }
    Ok(layers)
}

/// Resolves to the first value sent on `rx`, or when the sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.changed().await;
}

// ── Coordinator mode ──────────────────────────────────────────────────────────

async fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let mut config: CoordinatorConfig = read_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(model) = args.model {
        config.model_name = model;
    }
    if let Some(strategy) = args.strategy {
        config.default_strategy = strategy;
    }
    if args.profile.is_some() {
        config.profile_path = args.profile;
    }
    if args.no_participate {
        config.participate = false;
    }
    args.node.apply(&mut config.node);

    let capability = SystemProbe::new(config.node.clone()).detect_local_capability()?;
    let profile = load_profile(config.profile_path.as_deref())?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let advertise = match args.advertise {
        Some(addr) => addr,
        None => listener.local_addr()?.to_string(),
    };
    let max_frame_bytes = config.net.max_frame_bytes;
    let model_name = config.model_name.clone();
    let strategy = config.default_strategy;

    let coordinator = Arc::new(Coordinator::new(
        config,
        capability,
        Arc::new(PassthroughEngine::new()),
        profile,
        &advertise,
    )?);

    if let Some(path) = args.plan {
        let plan = load_plan(&path).with_context(|| format!("loading plan {}", path.display()))?;
        coordinator.install_plan(plan).await?;
    } else {
        let request = layermesh_types::protocol::PlanningRequest {
            model_name,
            strategy,
            nodes: vec![],
            layers: None,
            activate: true,
        };
        match coordinator.generate_plan(request).await {
            Ok(plan) => info!(plan = %plan.plan_name, "initial plan ready"),
            Err(e) => warn!(error = %e, "no initial plan; waiting for workers"),
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&coordinator).run_maintenance(stopped(stop_rx.clone())));

    info!(addr = %advertise, "coordinator up. Press Ctrl-C to stop");
    tokio::select! {
        result = serve(listener, coordinator, max_frame_bytes, stopped(stop_rx)) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, shutting down");
        }
    }
    let _ = stop_tx.send(true);
    Ok(())
}

// ── Worker mode ───────────────────────────────────────────────────────────────

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let mut config: WorkerConfig = read_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.advertise.is_some() {
        config.advertise_addr = args.advertise;
    }
    if args.coordinator.is_some() {
        config.coordinator_addr = args.coordinator;
    }
    if let Some(max) = args.max_sessions {
        config.max_concurrent_sessions = max;
    }
    args.node.apply(&mut config.node);

    let capability = SystemProbe::new(config.node.clone()).detect_local_capability()?;
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let advertise = match &config.advertise_addr {
        Some(addr) => addr.clone(),
        None => listener.local_addr()?.to_string(),
    };
    if config.coordinator_addr.is_none() {
        warn!("no coordinator configured; this worker must be registered by hand");
    }
    let max_frame_bytes = config.net.max_frame_bytes;

    let worker = Arc::new(StageWorker::new(config, capability, Arc::new(PassthroughEngine::new())));
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&worker).run_registration(advertise.clone(), stopped(stop_rx.clone())));
    tokio::spawn(Arc::clone(&worker).run_maintenance(stopped(stop_rx.clone())));

    info!(addr = %advertise, node_id = %worker.node_id(), "worker up. Press Ctrl-C to stop");
    tokio::select! {
        result = serve(listener, worker, max_frame_bytes, stopped(stop_rx)) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, shutting down");
        }
    }
    let _ = stop_tx.send(true);
    Ok(())
}

// ── Offline planning ──────────────────────────────────────────────────────────

fn run_plan(args: PlanArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.nodes)
        .with_context(|| format!("reading {}", args.nodes.display()))?;
    let descriptors: Vec<NodeDescriptor> = serde_json::from_str(&text)?;
    let nodes = descriptors
        .iter()
        .map(|d| d.validate().map(|()| d.to_virtual_node()))
        .collect::<Result<Vec<_>, _>>()?;

    let layers = load_profile(args.profile.as_deref())?;
    let planner = ExecutionPlanner::new(layers, PlannerConfig::default());
    let plan = planner.generate_plan(&nodes, &args.model, args.strategy)?;

    // The rendering already ends with the optimisation notes.
    println!("{}", plan.visualize());
    if let Some(path) = args.output {
        save_plan(&plan, &path)?;
        info!(path = %path.display(), "plan written");
    }
    Ok(())
}
