//! SkyMesh coordinator CLI
//!
//! Prepares and runs an emulation from a JSON configuration.

use clap::Parser;
use skymesh_core::NodeId;
use skymesh_env::{LocalChannel, SshChannel, TokioContext};
use skymesh_sim::runner::clean;
use skymesh_sim::{Emulation, EmulationConfig, Prepared, RunError, RunSummary, VirtualContext, WalkerOracle, WorkDirs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// SkyMesh distributed satellite network emulator
#[derive(Parser, Debug)]
#[command(name = "skymesh")]
#[command(about = "Emulate a satellite constellation network across machines", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "skymesh.json")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run in-process against in-memory links on a virtual clock
    #[arg(long)]
    dry_run: bool,

    /// Run every machine on this host instead of over ssh
    #[arg(long)]
    local: bool,

    /// Remove every emulated node from the fleet and exit
    #[arg(long)]
    clean: bool,

    /// Print the position and links of NODE at STEP and exit (e.g. SH1O2S3@10)
    #[arg(long, value_name = "NODE@STEP")]
    inspect: Option<String>,

    /// Override the run directory
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Override the seed of damage selection
    #[arg(short, long)]
    seed: Option<u64>,

    /// JSON output for scripting
    #[arg(long)]
    json: bool,
}

fn parse_inspect(spec: &str) -> Result<(NodeId, usize), String> {
    let (node, step) = spec
        .split_once('@')
        .ok_or_else(|| format!("expected NODE@STEP, got '{}'", spec))?;
    let node: NodeId = node.parse().map_err(|e| format!("{}", e))?;
    let step: usize = step.parse().map_err(|_| format!("bad step '{}'", step))?;
    Ok((node, step))
}

fn inspect(config: &EmulationConfig, spec: &str, json: bool) -> Result<(), String> {
    let (node, step) = parse_inspect(spec)?;
    let prepared = Prepared::build(config, &WalkerOracle::new()).map_err(|e| e.to_string())?;
    let timeline = &prepared.timeline;
    let position = timeline
        .position(node, step)
        .ok_or_else(|| format!("{} has no position at step {}", node, step))?;

    let (neighbours, ground) = match node.as_sat() {
        Some(sat) => (timeline.neighbours(sat, step), timeline.ground_stations_of(sat, step)),
        None => (Vec::new(), Vec::new()),
    };
    let machine = prepared.assignment.machine_of(node);

    if json {
        let out = serde_json::json!({
            "node": node.to_string(),
            "step": step,
            "machine": machine,
            "position": position,
            "neighbours": neighbours.iter().map(|(n, delay)| {
                serde_json::json!({ "node": n.to_string(), "delay_ms": delay })
            }).collect::<Vec<_>>(),
            "ground_stations": ground.iter().map(|(gid, delay)| {
                serde_json::json!({ "node": NodeId::Ground(*gid).to_string(), "delay_ms": delay })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?);
        return Ok(());
    }

    info!(
        "{} at step {}: lat {:.3} lon {:.3} alt {:.1} km",
        node, step, position.lat_deg, position.lon_deg, position.alt_km
    );
    if let Some(m) = machine {
        info!("  hosted on machine {}", m);
    }
    for (peer, delay) in &neighbours {
        let distance = timeline.distance_km(node, *peer, step).unwrap_or_default();
        info!("  ISL {} {:.0} km {:.3} ms", peer, distance, delay);
    }
    for (gid, delay) in &ground {
        info!("  GSL {} {:.3} ms", NodeId::Ground(*gid), delay);
    }
    Ok(())
}

async fn run(args: &Args, config: EmulationConfig) -> Result<RunSummary, RunError> {
    let seed = config.seed;
    let dirs = if args.local { WorkDirs::RunDir } else { WorkDirs::Configured };
    let emulation = Emulation::prepare(config, &WalkerOracle::new())?;

    if args.dry_run {
        emulation.run_in_memory(VirtualContext::shared(seed)).await
    } else if args.local {
        emulation
            .run_remote(Arc::new(LocalChannel::new()), dirs, TokioContext::shared(seed))
            .await
    } else {
        let channel = Arc::new(SshChannel::new(emulation.config().ssh_hosts()));
        emulation.run_remote(channel, dirs, TokioContext::shared(seed)).await
    }
}

fn report(summary: &RunSummary, json: bool) {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
        return;
    }

    info!("");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "steps {}/{} | links -{} ~{} +{} | reshaped {}",
        summary.completed_steps, summary.steps, summary.deleted, summary.updated, summary.added, summary.reshaped
    );
    info!(
        "overruns {} | faults {} | diagnostics {} ({} failed) | skipped events {}",
        summary.overruns.len(),
        summary.faults.len(),
        summary.diagnostics.len(),
        summary.failed_diagnostics(),
        summary.events_skipped
    );
    if summary.is_healthy() {
        info!("✅ every machine acknowledged every step");
    } else {
        error!(
            "❌ {} missed acknowledgements, {} link failures",
            summary.missed_acks.len(),
            summary.link_failures.len()
        );
        for step in summary.degraded_steps() {
            error!("  - step {} degraded", step);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let mut config = match EmulationConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = &args.run_dir {
        config = config.with_run_dir(dir);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    if let Some(spec) = &args.inspect {
        if let Err(e) = inspect(&config, spec, args.json) {
            error!("{}", e);
            std::process::exit(1);
        }
        return;
    }

    if args.clean {
        let failed = if args.local {
            clean(&config, Arc::new(LocalChannel::new()), WorkDirs::RunDir).await
        } else {
            clean(&config, Arc::new(SshChannel::new(config.ssh_hosts())), WorkDirs::Configured).await
        };
        if !failed.is_empty() {
            std::process::exit(1);
        }
        return;
    }

    if !args.json {
        info!("SkyMesh coordinator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "{} satellites, {} ground stations, {} machines",
            config.total_satellites(),
            config.ground_stations.len(),
            config.machines.len()
        );
    }

    match run(&args, config).await {
        Ok(summary) => {
            report(&summary, args.json);
            if !summary.is_healthy() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Run aborted: {}", e);
            std::process::exit(1);
        }
    }
}
