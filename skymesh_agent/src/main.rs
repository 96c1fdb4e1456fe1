//! SkyMesh Agent - one machine's share of the emulation
//!
//! Every invocation performs a single command against the work directory the
//! coordinator prepared and exits:
//! - `nodes` spawns one sandbox per local node and records the registry
//! - `networks <step>` applies the diffs of a step to the local links
//! - `routed` starts OSPF in the local nodes
//! - `damage` / `recovery` force or lift total loss on local nodes
//! - diagnostics (`ping`, `iperf`, `rtable`, `sr`, `ip`, `utility`)
//!
//! Link-changing commands print an `ApplyReport` as JSON on the last stdout
//! line; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skymesh_core::backend::IfAddr;
use skymesh_core::nodes::{damage_path, load_damage, registry_path, NodeManager, NodeRegistry, HOST_SYSCTLS};
use skymesh_core::routing::start_daemons;
use skymesh_core::{diagnostics, AgentRuntime, ApplyReport, IpRouteBackend, NodeId};
use skymesh_env::{run_command, UnshareLauncher};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// SkyMesh machine agent
#[derive(Parser, Debug)]
#[command(name = "skymesh-agent")]
#[command(about = "Drive the emulated nodes of one machine", long_about = None)]
struct Args {
    /// Work directory holding the manifest, settings and diffs
    #[arg(short, long, default_value = "/tmp/skymesh")]
    dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a sandbox for every local node
    Nodes,

    /// List local nodes and their damage state
    List,

    /// Apply the link diffs of a step
    Networks { step: usize },

    /// Start the routing daemon in local nodes (all when none given)
    Routed { nodes: Vec<NodeId> },

    /// Force total loss on the given local nodes
    Damage { nodes: Vec<NodeId> },

    /// Restore every damaged local node
    Recovery,

    /// Ping an address from a local node
    Ping { src: NodeId, dst: Ipv4Addr },

    /// Throughput test from a local node against a running server
    Iperf { src: NodeId, dst: Ipv4Addr },

    /// Start a one-shot throughput server in a local node
    IperfServer { node: NodeId },

    /// Route the given prefixes out of `src` through its interface to `via`
    Sr {
        src: NodeId,
        via: NodeId,
        dst_addrs: Vec<IfAddr>,
    },

    /// Dump the routing table of a local node
    Rtable { node: NodeId },

    /// List the interface addresses of a local node
    Ip { node: NodeId },

    /// Host CPU and memory snapshot
    Utility,

    /// Remove every local node
    Clean,
}

async fn open(dir: &PathBuf) -> Result<AgentRuntime<IpRouteBackend>> {
    AgentRuntime::open(dir.clone(), Arc::new(IpRouteBackend::new()))
        .await
        .with_context(|| format!("opening work dir {}", dir.display()))
}

fn print_report(report: &ApplyReport) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

async fn host_sysctls() {
    let mut args = vec!["-w".to_string()];
    args.extend(HOST_SYSCTLS.iter().map(|s| s.to_string()));
    if let Err(e) = run_command("sysctl", &args).await {
        warn!("host sysctls not applied: {}", e);
    }
}

async fn run(args: Args) -> Result<()> {
    let backend = IpRouteBackend::new();
    match args.command {
        Command::Nodes => {
            host_sysctls().await;
            let runtime = open(&args.dir).await?;
            let manager = NodeManager::new(
                &args.dir,
                Arc::clone(runtime.backend()),
                Arc::new(UnshareLauncher::new()),
            );
            let registry = manager.bootstrap(runtime.assignment(), runtime.machine()).await?;
            println!("{}", registry.local_count());
        }
        Command::List => {
            let registry = NodeRegistry::load(&registry_path(&args.dir)).await?;
            let damaged = load_damage(&damage_path(&args.dir)).await?;
            for (node, handle) in registry.local() {
                let state = if damaged.contains(&node) { "damaged" } else { "ok" };
                println!("{} {} {}", node, handle, state);
            }
        }
        Command::Networks { step } => {
            let runtime = open(&args.dir).await?;
            print_report(&runtime.apply_step(step).await?)?;
        }
        Command::Routed { nodes } => {
            let runtime = open(&args.dir).await?;
            let conf = runtime.settings().ospf.write(&args.dir).await?;
            let nodes = if nodes.is_empty() { runtime.local_nodes() } else { nodes };
            let failed = start_daemons(runtime.backend().as_ref(), &conf, &nodes).await;
            println!("{}", nodes.len() - failed.len());
        }
        Command::Damage { nodes } => {
            let mut runtime = open(&args.dir).await?;
            print_report(&runtime.damage(&nodes).await?)?;
        }
        Command::Recovery => {
            let mut runtime = open(&args.dir).await?;
            print_report(&runtime.recover().await?)?;
        }
        Command::Ping { src, dst } => {
            print!("{}", diagnostics::ping(&backend, &src.to_string(), dst).await?);
        }
        Command::Iperf { src, dst } => {
            print!("{}", diagnostics::iperf_client(&backend, &src.to_string(), dst).await?);
        }
        Command::IperfServer { node } => {
            print!("{}", diagnostics::iperf_server(&backend, &node.to_string()).await?);
        }
        Command::Sr { src, via, dst_addrs } => {
            let addrs: Vec<(String, IfAddr)> = dst_addrs.into_iter().map(|a| (String::new(), a)).collect();
            let installed =
                diagnostics::set_next_hop(&backend, &src.to_string(), &addrs, &via.to_string()).await?;
            println!("{}", installed.join("\n"));
        }
        Command::Rtable { node } => {
            print!("{}", diagnostics::route_table(&backend, &node.to_string()).await?);
        }
        Command::Ip { node } => {
            print!("{}", diagnostics::address_listing(&backend, &node.to_string()).await?);
        }
        Command::Utility => {
            print!("{}", diagnostics::utility_snapshot().await?);
        }
        Command::Clean => {
            let path = registry_path(&args.dir);
            let registry = if path.exists() {
                NodeRegistry::load(&path).await?
            } else {
                NodeRegistry::new()
            };
            let manager = NodeManager::new(&args.dir, Arc::new(backend), Arc::new(UnshareLauncher::new()));
            println!("{}", manager.clean(&registry).await);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;

    info!("skymesh-agent {:?} in {}", args.command, args.dir.display());
    run(args).await
}
