//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles all controller subsystems:
//! - Instance registry (redb)
//! - Launch gate (hold expiry loop, recovered on start)
//! - Warm pool manager
//! - Scaling controller
//! - Health monitor
//! - Target group registrar
//! - Notification bus + logging sink
//! - REST API (lifecycle callbacks, group control)
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --port 8443 --data-dir /var/lib/fleetgrid
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleetgrid_provider::{LaunchSpec, SimCloud};

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid fleet controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Capacity reconciliation interval in seconds.
        #[arg(long, default_value = "15")]
        reconcile_interval: u64,

        /// Warm pool reconciliation interval in seconds.
        #[arg(long, default_value = "30")]
        warm_pool_interval: u64,

        /// Health polling interval in seconds.
        #[arg(long, default_value = "10")]
        health_interval: u64,

        /// Target registrar sync interval in seconds.
        #[arg(long, default_value = "10")]
        registrar_interval: u64,

        /// Launch-gate expiry check interval in seconds.
        #[arg(long, default_value = "5")]
        hook_tick: u64,

        /// Seed desired capacity (only applied when set).
        #[arg(long)]
        desired_capacity: Option<u32>,

        /// Seed warm pool target size (only applied when set).
        #[arg(long)]
        warm_pool_target: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            reconcile_interval,
            warm_pool_interval,
            health_interval,
            registrar_interval,
            hook_tick,
            desired_capacity,
            warm_pool_target,
        } => {
            run_standalone(StandaloneConfig {
                port,
                data_dir,
                reconcile_interval,
                warm_pool_interval,
                health_interval,
                registrar_interval,
                hook_tick,
                desired_capacity,
                warm_pool_target,
            })
            .await
        }
    }
}

struct StandaloneConfig {
    port: u16,
    data_dir: PathBuf,
    reconcile_interval: u64,
    warm_pool_interval: u64,
    health_interval: u64,
    registrar_interval: u64,
    hook_tick: u64,
    desired_capacity: Option<u32>,
    warm_pool_target: Option<u32>,
}

async fn run_standalone(config: StandaloneConfig) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // Instance registry.
    let state = fleetgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "instance registry opened");

    // Seed capacity overrides through the validated config path.
    if config.desired_capacity.is_some() || config.warm_pool_target.is_some() {
        let mut group = state.get_group()?;
        if let Some(desired) = config.desired_capacity {
            group.desired_capacity = desired;
        }
        if let Some(target) = config.warm_pool_target {
            group.warm_pool.target_size = target;
            group.warm_pool.max_size = group.warm_pool.max_size.max(target);
        }
        state.put_group(&group)?;
        info!(
            desired = group.desired_capacity,
            warm_target = group.warm_pool.target_size,
            "group configuration seeded from flags"
        );
    }

    // Provider seam. The simulated backend stands in until a cloud
    // provider implementation is linked.
    let cloud = Arc::new(SimCloud::new());
    info!("simulated provider backend initialized");

    // Notification bus + logging sink.
    let bus = fleetgrid_events::NotificationBus::default();

    // Launch gate: recover durable holds, then run the expiry loop.
    let hooks = Arc::new(fleetgrid_hooks::LifecycleHookCoordinator::new(
        state.clone(),
        bus.clone(),
        fleetgrid_hooks::HookConfig::default(),
    ));
    let (pending, restored) = hooks.recover()?;
    info!(pending, restored, "launch gate recovered");

    // Warm pool manager.
    let warm_pool = Arc::new(fleetgrid_warmpool::WarmPoolManager::new(
        state.clone(),
        cloud.clone(),
        bus.clone(),
        LaunchSpec::default(),
    ));

    // Scaling controller.
    let controller = Arc::new(fleetgrid_scaler::ScalingController::new(
        state.clone(),
        cloud.clone(),
        warm_pool.clone(),
        hooks.clone(),
        bus.clone(),
        LaunchSpec::default(),
    ));
    let reconcile_signal = controller.reconcile_signal();

    // Health monitor.
    let health = Arc::new(fleetgrid_health::HealthMonitor::new(
        state.clone(),
        cloud.clone(),
    ));

    // Target group registrar.
    let registrar = Arc::new(fleetgrid_registrar::TargetGroupRegistrar::new(
        state.clone(),
        cloud.clone(),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sink_handle = fleetgrid_events::spawn_log_sink(&bus, shutdown_rx.clone());

    let hooks_handle = {
        let hooks = hooks.clone();
        let shutdown = shutdown_rx.clone();
        let tick = Duration::from_secs(config.hook_tick);
        tokio::spawn(async move { hooks.run(tick, shutdown).await })
    };

    let warm_pool_handle = {
        let warm_pool = warm_pool.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.warm_pool_interval);
        tokio::spawn(async move { warm_pool.run(interval, shutdown).await })
    };

    let controller_handle = {
        let controller = controller.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.reconcile_interval);
        tokio::spawn(async move { controller.run(interval, shutdown).await })
    };

    let health_handle = {
        let health = health.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.health_interval);
        tokio::spawn(async move { health.run(interval, shutdown).await })
    };

    let registrar_handle = {
        let registrar = registrar.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.registrar_interval);
        tokio::spawn(async move { registrar.run(interval, shutdown).await })
    };

    // ── Start API server ───────────────────────────────────────

    let router = fleetgrid_api::build_router(fleetgrid_api::ApiState {
        store: state,
        hooks,
        reconcile: reconcile_signal,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install CTRL+C handler");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = sink_handle.await;
    let _ = hooks_handle.await;
    let _ = warm_pool_handle.await;
    let _ = controller_handle.await;
    let _ = health_handle.await;
    let _ = registrar_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
