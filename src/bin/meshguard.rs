//! meshguard daemon binary
//!
//! Runs an edge or a super from a YAML configuration file, or solves a
//! latency matrix offline.

use clap::{Parser, Subcommand};
use meshguard::config::{EdgeConfig, SuperConfig};
use meshguard::control::{serve_edge_api, HttpFetcher, SuperState};
use meshguard::routing::{solve, Graph};
use meshguard::tap::{Tap, DEFAULT_MTU};
use meshguard::{Device, DeviceError, DeviceEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Full-mesh layer-2 overlay VPN
#[derive(Parser, Debug)]
#[command(name = "meshguard", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an edge node
    Edge {
        /// Path to the edge configuration file
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Run a super node
    Super {
        /// Path to the super configuration file
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Compute next-hop and distance tables for a latency matrix
    Solve {
        /// Whitespace separated matrix, `Inf` for no edge
        #[arg(value_name = "FILE")]
        matrix: PathBuf,
    },
}

/// `RUST_LOG` wins over the configured directives.
fn init_logging(directives: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    fmt().with_env_filter(filter).with_target(true).init();
}

fn fail(what: &str, e: impl std::fmt::Display) -> ! {
    error!("{}: {}", what, e);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Command::Edge { config: path } => {
            let config = match EdgeConfig::load_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    init_logging("info");
                    fail("Failed to load configuration", e);
                }
            };
            init_logging(&config.log.filter_directives());
            info!(path = %path.display(), node = %config.node_id, "meshguard edge starting");
            match run_edge(config, &path).await {
                Ok(0) => info!("meshguard edge stopped"),
                Ok(code) => std::process::exit(code),
                Err(e) => fail("Edge failed", e),
            }
        }
        Command::Super { config: path } => {
            let config = match SuperConfig::load_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    init_logging("info");
                    fail("Failed to load configuration", e);
                }
            };
            init_logging(&config.log.filter_directives());
            info!(path = %path.display(), "meshguard super starting");
            if let Err(e) = run_super(config).await {
                fail("Super failed", e);
            }
            info!("meshguard super stopped");
        }
        Command::Solve { matrix } => {
            init_logging("warn");
            let text = match std::fs::read_to_string(&matrix) {
                Ok(text) => text,
                Err(e) => fail(&format!("Cannot read {}", matrix.display()), e),
            };
            let output = match solve(&text) {
                Ok(output) => output,
                Err(e) => fail("Cannot solve matrix", e),
            };
            match output.to_yaml() {
                Ok(yaml) => print!("{}", yaml),
                Err(e) => fail("Cannot encode tables", e),
            }
            println!();
            print!("{}", output);
        }
    }
}

/// Run until ctrl-c or a super instruction. Returns the exit code.
async fn run_edge(config: EdgeConfig, path: &Path) -> Result<i32, DeviceError> {
    let identity = config.identity()?;
    let tap = config.interface.open().await?;
    info!(tap = %tap.name(), mtu = config.interface.mtu, "Interface opened");

    let mut graph = Graph::new(config.graph_settings());
    if !config.next_hop_table.is_empty() {
        graph.set_nh_table(config.next_hop_table.clone());
    }

    let mut device = Device::new(config.device_settings(Some(path)), identity, tap, graph);
    let super_node = &config.dynamic_route.super_node;
    if super_node.use_super_node {
        let fetcher = HttpFetcher::new(&super_node.edge_api_url)?;
        device = device.with_fetcher(Arc::new(fetcher));
    }
    let device = Arc::new(device);
    let mut events = device.events();

    for peer in config.peer_configs()? {
        device.add_peer(peer).await?;
    }
    let port = device.up().await?;
    info!(
        node = %device.node_id(),
        key = %device.public_key(),
        port,
        "meshguard edge running, press Ctrl+C to exit"
    );

    let code = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            0
        }
        event = next_event(&mut events) => exit_code(event),
    };

    device.close().await;
    Ok(code)
}

async fn next_event(events: &mut Option<mpsc::Receiver<DeviceEvent>>) -> Option<DeviceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn exit_code(event: Option<DeviceEvent>) -> i32 {
    match event {
        Some(DeviceEvent::Shutdown { reason }) => {
            info!(reason = %reason, "Shutting down on super request");
            0
        }
        Some(DeviceEvent::ThrowError { code, reason }) => {
            error!(code, reason = %reason, "Exiting on super error");
            code
        }
        Some(DeviceEvent::Panic { reason }) => {
            error!(reason = %reason, "Aborting on super request");
            1
        }
        None => {
            warn!("Device event stream closed");
            1
        }
    }
}

async fn run_super(config: SuperConfig) -> Result<(), DeviceError> {
    let mut graph = Graph::new(config.graph_settings());
    if config.graph.static_mode {
        graph.set_nh_table(config.next_hop_table.clone());
    }
    let state = Arc::new(SuperState::new(config.super_settings(), graph));
    for peer in config.super_peers()? {
        if !state.add_peer(peer.clone()) {
            warn!(node = %peer.node_id, "Duplicate super peer ignored");
        }
    }

    let api = serve_edge_api(state.clone(), &config.edge_api_addr()).await?;

    let mut devices = Vec::new();
    for (bind_ip, identity) in config.identities()? {
        let name = if bind_ip.is_ipv4() { "super-v4" } else { "super-v6" };
        let device = Arc::new(
            Device::new(
                config.device_settings(bind_ip),
                identity,
                Tap::dummy(name, DEFAULT_MTU),
                Graph::new(config.graph_settings()),
            )
            .with_super_state(state.clone()),
        );
        for peer in config.peer_configs()? {
            device.add_peer(peer).await?;
        }
        let port = device.up().await?;
        info!(%bind_ip, key = %device.public_key(), port, "Super device up");
        devices.push(device);
    }
    info!(api = %api.local_addr(), "meshguard super running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    for device in devices {
        device.close().await;
    }
    api.shutdown().await;
    Ok(())
}
