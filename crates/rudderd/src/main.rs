//! rudderd — the rudder daemon.
//!
//! Single binary that assembles the control loops around the shared
//! state store:
//! - State store (redb)
//! - Health probe monitor
//! - Replica reconciliation loop
//! - Rollout loop
//! - Utilization sampler + autoscaler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rudderd run --config rudder.toml --port 7070 --data-dir /var/lib/rudder
//! ```

mod control_plane;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{RwLock, watch};
use tracing::info;

use control_plane::{ControlPlane, ScaleArbiter, seed_desired_state};

#[derive(Parser)]
#[command(name = "rudderd", about = "rudder daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (all control loops in one process).
    Run {
        /// Path to the manifest.
        #[arg(long, default_value = "rudder.toml")]
        config: PathBuf,

        /// Port the REST API listens on.
        #[arg(long, default_value = "7070")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/rudder")]
        data_dir: PathBuf,

        /// Replica reconciliation interval in seconds.
        #[arg(long, default_value = "5")]
        replica_interval: u64,

        /// Rollout step interval in seconds.
        #[arg(long, default_value = "5")]
        rollout_interval: u64,

        /// Utilization sampling interval in seconds.
        #[arg(long, default_value = "5")]
        sample_interval: u64,

        /// Simulated CPU utilization percent, until a metrics agent
        /// reports real figures.
        #[arg(long, default_value = "50.0")]
        sim_cpu: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rudderd=debug,rudder=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            replica_interval,
            rollout_interval,
            sample_interval,
            sim_cpu,
        } => {
            run(
                config,
                port,
                data_dir,
                replica_interval,
                rollout_interval,
                sample_interval,
                sim_cpu,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: PathBuf,
    port: u16,
    data_dir: PathBuf,
    replica_interval: u64,
    rollout_interval: u64,
    sample_interval: u64,
    sim_cpu: f64,
) -> anyhow::Result<()> {
    info!("rudder daemon starting");

    // Manifest is validated as a whole; an invalid one stops the daemon
    // here, before any state changes.
    let manifest = rudder_config::Manifest::from_file(&config)?;
    info!(path = ?config, "manifest loaded");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("rudder.redb");

    // ── State store ────────────────────────────────────────────
    let state = rudder_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let desired = seed_desired_state(&state, &manifest)?;

    // ── Rollout controller (resume an interrupted rollout) ─────
    let rollout = match state.get_rollout_plan()? {
        Some(plan) => {
            info!(
                old = %plan.old_template,
                new = %plan.new_template,
                "resuming interrupted rollout"
            );
            rudder_rollout::RolloutController::resume_from(plan)
        }
        None => rudder_rollout::RolloutController::new(),
    };
    let rollout = Arc::new(RwLock::new(rollout));

    // ── Scheduler + executor + probe monitor ───────────────────
    // In-process placement; a cluster scheduler client slots in here.
    let scheduler = Arc::new(rudder_replicas::FakeScheduler::new());
    let executor = rudder_replicas::ActionExecutor::new(state.clone(), scheduler);
    let monitor = Arc::new(rudder_health::ProbeMonitor::new(state.clone()));
    info!("executor and probe monitor initialized");

    let plane = Arc::new(ControlPlane::new(
        state.clone(),
        executor,
        monitor.clone(),
        rollout.clone(),
    ));
    plane.restart_probes().await?;

    // ── API state + scale arbiter ──────────────────────────────
    let api_state = rudder_api::ApiState::new(state.clone(), rollout.clone());
    let arbiter = Arc::new(ScaleArbiter::new(
        state.clone(),
        rollout.clone(),
        api_state.manual.clone(),
    ));

    // ── Autoscaler + sampler ───────────────────────────────────
    let decision_arbiter = arbiter.clone();
    let mut autoscaler =
        rudder_autoscale::Autoscaler::new(state.clone(), manifest.autoscale_window())
            .with_decision_fn(Box::new(move |target| {
                let arbiter = decision_arbiter.clone();
                Box::pin(async move { arbiter.propose_autoscale(target).await })
            }));
    let autoscale_tick = manifest.autoscale_tick();
    info!(
        window_secs = manifest.autoscale_window().as_secs(),
        tick_secs = autoscale_tick.as_secs(),
        "autoscaler initialized"
    );

    let sampler = rudder_autoscale::Sampler::new(
        state.clone(),
        Box::new(rudder_autoscale::SimulatedSource::new(sim_cpu)),
    );

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let replica_shutdown = shutdown_rx.clone();
    let rollout_shutdown = shutdown_rx.clone();
    let autoscale_shutdown = shutdown_rx.clone();
    let sampler_shutdown = shutdown_rx.clone();

    // ── Start background loops ─────────────────────────────────
    let replica_plane = plane.clone();
    let replica_handle = tokio::spawn(async move {
        replica_plane
            .run_replica_loop(Duration::from_secs(replica_interval), replica_shutdown)
            .await;
    });

    let rollout_plane = plane.clone();
    let rollout_handle = tokio::spawn(async move {
        rollout_plane
            .run_rollout_loop(Duration::from_secs(rollout_interval), rollout_shutdown)
            .await;
    });

    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_tick, autoscale_shutdown).await;
    });

    let sampler_handle = tokio::spawn(async move {
        sampler
            .run(Duration::from_secs(sample_interval), sampler_shutdown)
            .await;
    });

    // ── API server ─────────────────────────────────────────────
    let router = rudder_api::build_router(api_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, replicas = desired.desired_replicas, template = %desired.template, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    monitor.stop_all().await;

    // Wait for background loops.
    let _ = replica_handle.await;
    let _ = rollout_handle.await;
    let _ = autoscale_handle.await;
    let _ = sampler_handle.await;

    info!("rudder daemon stopped");
    Ok(())
}
