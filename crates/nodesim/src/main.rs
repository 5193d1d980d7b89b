use clap::{Args, Parser, Subcommand};
use nodesim_controller::{
    create_resource, list_resources, ApiClient, ApiClientConfig, FleetController,
    FleetControllerConfig, HeartbeatConfig, HeartbeatUpdater, ListParams, MockObjectStore,
    ObjectStore, PodStatusFaker, PodStatusFakerConfig,
};
use nodesim_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use nodesim_core::{AcceleratorInventory, Node, NodeFleet, Resource, SimConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "nodesim", about = "Virtual node fleet simulator")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulator against a Kubernetes-compatible API server
    Run {
        /// API server base URL
        #[arg(long, env = "NODESIM_API_URL", default_value = "http://127.0.0.1:8080")]
        api_url: String,
        /// Bearer token for the API server
        #[arg(long, env = "NODESIM_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
        #[command(flatten)]
        loops: LoopArgs,
    },
    /// Simulate fleets from a YAML file against an in-memory store
    Simulate {
        /// YAML file with one or more NodeFleet documents
        #[arg(long)]
        fleet: PathBuf,
        /// How long to run before printing the resulting nodes
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
        #[command(flatten)]
        loops: LoopArgs,
    },
}

/// Settings shared by every control loop
#[derive(Args)]
struct LoopArgs {
    /// Seconds between heartbeats of each node
    #[arg(long, default_value_t = 20)]
    heartbeat_interval_secs: u64,
    /// Nodes updated concurrently by the heartbeat updater
    #[arg(long, default_value_t = 5)]
    heartbeat_workers: usize,
    /// Fleets reconciled concurrently
    #[arg(long, default_value_t = 2)]
    reconcile_workers: usize,
    /// Nodes synchronized concurrently within a fleet
    #[arg(long, default_value_t = 5)]
    fan_out_workers: usize,
    /// Seconds between full fleet resyncs
    #[arg(long, default_value_t = 30)]
    resync_interval_secs: u64,
    /// Do not report bound workloads as running
    #[arg(long)]
    no_pod_faker: bool,
    /// Seconds between pod status passes
    #[arg(long, default_value_t = 5)]
    pod_faker_interval_secs: u64,
    /// Host IP reported for simulated workloads
    #[arg(long, default_value = "10.0.0.1")]
    pod_host_ip: String,
    /// Pod IP reported for simulated workloads
    #[arg(long, default_value = "10.224.0.1")]
    pod_ip: String,
}

impl LoopArgs {
    fn fleet_config(&self) -> FleetControllerConfig {
        FleetControllerConfig {
            reconcile_workers: self.reconcile_workers,
            fan_out_workers: self.fan_out_workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
        }
    }

    fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            workers: self.heartbeat_workers,
        }
    }

    fn pod_faker_config(&self) -> Option<PodStatusFakerConfig> {
        (!self.no_pod_faker).then(|| PodStatusFakerConfig {
            interval: Duration::from_secs(self.pod_faker_interval_secs.max(1)),
            host_ip: self.pod_host_ip.clone(),
            pod_ip: self.pod_ip.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run {
            api_url,
            token,
            insecure,
            loops,
        } => run(&api_url, token, insecure, &loops).await,
        Commands::Simulate {
            fleet,
            duration_secs,
            loops,
        } => simulate(&fleet, Duration::from_secs(duration_secs), &loops).await,
    }
}

/// Run every loop against an API server until Ctrl-C
async fn run(
    api_url: &str,
    token: Option<String>,
    insecure: bool,
    loops: &LoopArgs,
) -> miette::Result<()> {
    info!("Starting nodesim against {}", api_url);

    let client = ApiClient::with_config(&ApiClientConfig {
        base_url: api_url.to_string(),
        token,
        insecure,
        ..Default::default()
    })?;
    let store: Arc<dyn ObjectStore> = Arc::new(client);

    let cancel = CancellationToken::new();
    let handles = spawn_loops(store, loops, &cancel);
    info!("All loops started");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    shutdown(cancel, handles).await;
    Ok(())
}

/// Load fleets into an in-memory store, run the loops for a while and print
/// the resulting nodes
async fn simulate(path: &Path, duration: Duration, loops: &LoopArgs) -> miette::Result<()> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("Failed to read {}: {}", path.display(), e))?;
    let fleets: Vec<NodeFleet> = nodesim_core::from_yaml_documents(&data)?;
    if fleets.is_empty() {
        return Err(miette::miette!("{} contains no NodeFleet documents", path.display()));
    }

    let store = Arc::new(MockObjectStore::new());
    for fleet in &fleets {
        create_resource(&*store, fleet).await?;
        info!("Loaded fleet {}", fleet.fleet_key());
    }

    let cancel = CancellationToken::new();
    let handles = spawn_loops(store.clone(), loops, &cancel);

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
        }
    }
    shutdown(cancel, handles).await;

    print_nodes(&*store).await
}

fn spawn_loops(
    store: Arc<dyn ObjectStore>,
    loops: &LoopArgs,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let sim = SimConfig::default();
    let mut handles = Vec::new();

    let fleets = FleetController::new(store.clone(), loops.fleet_config(), sim.clone());
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = fleets.run(token).await {
            error!("Fleet controller error: {}", e);
        }
    }));

    let heartbeat = HeartbeatUpdater::new(store.clone(), loops.heartbeat_config(), sim.clone());
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = heartbeat.run(token).await {
            error!("Heartbeat updater error: {}", e);
        }
    }));

    if let Some(config) = loops.pod_faker_config() {
        let faker = PodStatusFaker::new(store, config, sim);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = faker.run(token).await {
                error!("Pod status faker error: {}", e);
            }
        }));
    }

    handles
}

/// Cancel every loop and wait a bounded time for them to finish
async fn shutdown(cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    let finished = tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
    if finished.is_err() {
        error!("Timed out waiting for loops to stop");
    }

    info!("Shutdown complete");
}

fn format_resources(resources: Option<&BTreeMap<String, Quantity>>) -> String {
    resources
        .map(|r| {
            r.iter()
                .map(|(name, q)| format!("{}={}", name, q.0))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

async fn print_nodes(store: &dyn ObjectStore) -> miette::Result<()> {
    let nodes: Vec<Node> = list_resources(store, None, &ListParams::all()).await?;
    let inventories: Vec<AcceleratorInventory> =
        list_resources(store, None, &ListParams::all()).await?;

    println!("{} nodes", nodes.len());
    for node in &nodes {
        let name = node.name().unwrap_or_default();
        let status = node.status.as_ref();
        println!("{}", name);
        println!(
            "  capacity:    {}",
            format_resources(status.and_then(|s| s.capacity.as_ref()))
        );
        println!(
            "  allocatable: {}",
            format_resources(status.and_then(|s| s.allocatable.as_ref()))
        );

        let inventory = inventories
            .iter()
            .find(|i| i.spec.node_name == name)
            .and_then(|i| i.status.as_ref());
        if let Some(inventory) = inventory {
            println!(
                "  accelerators: {} cards, {}/{} bytes free",
                inventory.card_count, inventory.free_memory, inventory.total_memory
            );
        }
    }
    Ok(())
}
