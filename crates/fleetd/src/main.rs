//! fleetd: keeps a fleet sized to its utilization.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetd/fleet.toml
//! fleetd simulate --config fleet.toml --duration 10m
//! fleetd check-config --config fleet.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_health::HttpProbe;
use fleet_state::{StateStore, parse_duration};
use fleetd::config::{FleetConfig, Settings};
use fleetd::daemon::{Backends, Daemon};
use fleetd::remote::{HttpClient, HttpMetricSource, RemoteLoadBalancer, RemoteProvisioner};
use fleetd::sim::Simulation;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet autoscaling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against the provisioning, load balancer and metric endpoints.
    Run {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
    /// Run the control loop against in-process backends.
    Simulate {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Stop after this long (e.g. "90s"). Runs until Ctrl-C otherwise.
        #[arg(long)]
        duration: Option<String>,
    },
    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Simulate { config, duration } => simulate(&config, duration.as_deref()).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn open_store(settings: &Settings) -> anyhow::Result<StateStore> {
    match &settings.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("fleet.redb");
            let store = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            Ok(store)
        }
        None => {
            info!("no data_dir configured; membership will not survive restarts");
            Ok(StateStore::open_in_memory()?)
        }
    }
}

/// Flip the shutdown channel on Ctrl-C.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    let settings = config.resolve()?;
    let endpoints = config.remote_endpoints()?;
    let store = open_store(&settings)?;

    let backends = Backends {
        metric: Arc::new(HttpMetricSource::new(
            HttpClient::new(&endpoints.metric),
            &endpoints.metric_path,
        )),
        provisioner: Arc::new(RemoteProvisioner::new(
            HttpClient::new(&endpoints.provisioning),
            endpoints.terminate_timeout,
        )),
        load_balancer: Arc::new(RemoteLoadBalancer::new(
            HttpClient::new(&endpoints.load_balancer),
            endpoints.lb_timeout,
        )),
        probe: Arc::new(HttpProbe::new(
            settings.health.path.clone(),
            settings.health.timeout,
        )),
    };

    info!(fleet = %settings.name, "fleetd starting");
    let daemon = Daemon::build(&settings, store, backends);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    daemon.run(shutdown_rx).await
}

async fn simulate(path: &Path, duration: Option<&str>) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    let settings = config.resolve()?;
    let limit = match duration {
        Some(value) => Some(
            parse_duration(value).ok_or_else(|| anyhow::anyhow!("invalid duration {value:?}"))?,
        ),
        None => None,
    };
    let store = open_store(&settings)?;

    let simulation = Simulation::new(&config.simulation);
    info!(
        fleet = %settings.name,
        failure_rate = config.simulation.failure_rate,
        "fleetd simulating"
    );
    let daemon = Daemon::build(&settings, store, simulation.backends());
    let controller = daemon.controller().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(daemon.run(shutdown_rx));

    match limit {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => info!("simulation time limit reached"),
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(true);
    task.await??;

    let snapshot = controller.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!(
        "instances running: {}, registered targets: {}",
        simulation.provisioner.instances().len(),
        simulation.routing.len()
    );
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    let settings = config.resolve()?;

    println!(
        "fleet {}: size [{}, {}], desired {}",
        settings.name, settings.min_size, settings.max_size, settings.desired_capacity
    );
    for alarm in &settings.alarms {
        println!(
            "  alarm {}: {:?} {} for {} period(s)",
            alarm.kind, alarm.comparison, alarm.threshold, alarm.evaluation_periods
        );
    }
    println!(
        "  scale out {:?} (cooldown {:?}), scale in {:?} (cooldown {:?})",
        settings.scale_out.adjustment,
        settings.scale_out.cooldown,
        settings.scale_in.adjustment,
        settings.scale_in.cooldown
    );
    match config.remote_endpoints() {
        Ok(_) => println!("  endpoints configured; ready for `run`"),
        Err(e) => println!("  {e}; only `simulate` is available"),
    }
    Ok(())
}
