//! clawswarm - Clawbernetes swarm coordinator
//!
//! Polls the local accelerators, sizes batches, gossips device state with
//! peer coordinators and rebalances hot devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use claw_swarm::gossip::serve;
use claw_swarm::{
    DeviceDescriptor, FakeTelemetrySource, NodeId, NvidiaSmiSource, RawTelemetry, SwarmConfig,
    SwarmCoordinator, SwarmError, TelemetrySource, Tier, WebSocketTransport,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "clawswarm")]
#[command(about = "Clawbernetes swarm coordinator")]
#[command(version)]
struct Cli {
    /// Path to config file (TOML); defaults are used when omitted
    #[arg(short, long, global = true, env = "CLAWSWARM_CONFIG")]
    config: Option<PathBuf>,

    /// Use a built-in simulated fleet instead of nvidia-smi
    #[arg(long, global = true)]
    simulate: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until interrupted
    Run,

    /// Run a single round and print the result as JSON
    Round {
        /// Workload label
        #[arg(long)]
        workload: Option<String>,

        /// Model size in MB
        #[arg(long)]
        model_size_mb: Option<u64>,
    },

    /// Enumerate local accelerators and their tiers
    Devices,

    /// Generate a config file with defaults
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "clawswarm.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            run(config, cli.simulate).await?;
        }

        Commands::Round {
            workload,
            model_size_mb,
        } => {
            let config = load_config(cli.config.as_deref())?;
            round(config, cli.simulate, workload, model_size_mb).await?;
        }

        Commands::Devices => {
            let config = load_config(cli.config.as_deref())?;
            devices(&config, cli.simulate).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("clawswarm=info".parse()?)
        .add_directive("claw_swarm=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SwarmConfig> {
    match path {
        Some(path) => {
            let config = SwarmConfig::from_file(path)?;
            info!(config = %path.display(), "loaded config");
            Ok(config)
        }
        None => Ok(SwarmConfig::default()),
    }
}

fn telemetry_source(config: &SwarmConfig, simulate: bool) -> Arc<dyn TelemetrySource> {
    if simulate {
        info!("using simulated fleet");
        return Arc::new(simulated_fleet());
    }
    match &config.telemetry.nvidia_smi_path {
        Some(path) => Arc::new(NvidiaSmiSource::with_path(path.clone())),
        None => Arc::new(NvidiaSmiSource::new()),
    }
}

/// A small mixed fleet for hosts without GPUs.
fn simulated_fleet() -> FakeTelemetrySource {
    let fleet = [
        ("NVIDIA GeForce RTX 4090", 24564, 8.9, 0.85, 0.6),
        ("NVIDIA GeForce RTX 3060", 12288, 8.6, 0.35, 0.4),
        ("NVIDIA GeForce GTX 1050", 2048, 6.1, 0.1, 0.2),
    ];

    fleet.into_iter().zip(0u32..).fold(
        FakeTelemetrySource::new(),
        |source, ((name, total_memory_mb, compute_capability, compute, memory), index)| {
            source.with_device(
                DeviceDescriptor {
                    index,
                    name: name.to_string(),
                    total_memory_mb,
                    compute_capability,
                },
                RawTelemetry {
                    compute_utilization: compute,
                    memory_utilization: memory,
                    temperature_c: 45.0 + 40.0 * compute,
                    power_watts: 50.0 + 300.0 * compute,
                },
            )
        },
    )
}

fn build_coordinator(config: SwarmConfig, simulate: bool) -> anyhow::Result<Arc<SwarmCoordinator>> {
    let source = telemetry_source(&config, simulate);
    let transport = Arc::new(WebSocketTransport::new(config.gossip.attempt_timeout()));
    let coordinator = SwarmCoordinator::new(config, source, transport)?;
    Ok(Arc::new(coordinator))
}

async fn run(config: SwarmConfig, simulate: bool) -> anyhow::Result<()> {
    let interval = Duration::from_secs(config.round.interval_secs);
    let workload = config.round.workload.clone();
    let model_size_mb = config.round.model_size_mb;
    let listen_addr = config.gossip.listen_addr;
    let peers = config.gossip.peers.clone();

    let coordinator = build_coordinator(config, simulate)?;
    for peer in peers {
        coordinator.register_peer(peer.uri, NodeId::new(peer.node_id));
    }

    let nodes = coordinator.discover().await?;
    info!(nodes, "coordinator active");

    let server = match listen_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            Some(tokio::spawn(serve(
                listener,
                coordinator.clone(),
                coordinator.shutdown_token(),
            )))
        }
        None => None,
    };

    let signal = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.shutdown();
        }
    });

    let shutdown = coordinator.shutdown_token();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match coordinator.run_round(&workload, model_size_mb).await {
            Ok(result) => {
                let failed = result
                    .nodes
                    .iter()
                    .filter(|n| n.outcome.batch_size().is_none())
                    .count();
                info!(
                    workload = %result.workload,
                    swarm_load = result.swarm_load,
                    nodes = result.nodes.len(),
                    failed,
                    protective = result.protective_response,
                    "round finished"
                );
            }
            Err(SwarmError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "round failed");
                return Err(e.into());
            }
        }

        match coordinator.rebalance().await {
            Ok(report) if report.triggered => {
                info!(
                    skew = report.skew,
                    adjusted = report.adjustments.len(),
                    "rebalanced"
                );
            }
            Ok(_) => {}
            Err(SwarmError::Cancelled) => break,
            Err(e) => warn!(error = %e, "rebalance failed"),
        }
    }

    if let Some(server) = server {
        server.await??;
    }
    info!("clawswarm stopped");
    Ok(())
}

async fn round(
    config: SwarmConfig,
    simulate: bool,
    workload: Option<String>,
    model_size_mb: Option<u64>,
) -> anyhow::Result<()> {
    let workload = workload.unwrap_or_else(|| config.round.workload.clone());
    let model_size_mb = model_size_mb.unwrap_or(config.round.model_size_mb);
    let peers = config.gossip.peers.clone();

    let coordinator = build_coordinator(config, simulate)?;
    for peer in peers {
        coordinator.register_peer(peer.uri, NodeId::new(peer.node_id));
    }

    let result = coordinator.run_round(&workload, model_size_mb).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn devices(config: &SwarmConfig, simulate: bool) -> anyhow::Result<()> {
    let source = telemetry_source(config, simulate);
    let devices = source.enumerate().await?;

    if devices.is_empty() {
        println!("No accelerators detected");
        return Ok(());
    }

    println!("Found {} accelerator(s):\n", devices.len());
    for device in &devices {
        let tier = Tier::classify(device.total_memory_mb, device.compute_capability);
        println!(
            "  [{}] {} - {} MB, compute {:.1}, tier {}",
            device.index, device.name, device.total_memory_mb, device.compute_capability, tier
        );
    }
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let json = SwarmConfig::default().to_toml()?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, json)?;

    println!("Config written to {}", output.display());
    Ok(())
}
