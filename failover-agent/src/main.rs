//! Failover Agent - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use failover_agent::api::{self, ApiState};
use failover_agent::config::Config;
use failover_agent::daemon::{ShutdownCoordinator, Watchdog};
use failover_agent::scheduler::{ReplicationRunner, Scheduler, SchedulerSettings};
use failover_agent::transfer::{CodecStage, ZstdStage};
use failover_agent::transport::{serve, ConnectionPool, ReceiverContext};
use failover_agent::utils;
use failover_store::{Inventory, ReplicationLog, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Force one run of this target, then exit
    #[arg(long, value_name = "TARGET_ID")]
    run_once: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.compact)?;

    tracing::info!(
        "Starting failover-agent v{} (server: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.server_name
    );

    std::fs::create_dir_all(&config.agent.data_dir)
        .with_context(|| format!("Failed to create {}", config.agent.data_dir.display()))?;
    let store = Arc::new(
        SqliteStore::open(&config.store.db_path, config.store.pool_size).context("Failed to open inventory")?,
    );
    let inventory: Arc<dyn Inventory> = store.clone();
    let log: Arc<dyn ReplicationLog> = store;

    let codec: Arc<dyn CodecStage> = Arc::new(ZstdStage::new(config.transport.compression_level)?);
    let runner = Arc::new(ReplicationRunner {
        inventory: inventory.clone(),
        pool: Arc::new(ConnectionPool::new(config.transport.max_connections_per_destination)),
        exclusions: config.exclusions(),
        root: config.sync.root.clone(),
        batch_size: config.sync.batch_size,
        data_dir: config.agent.data_dir.clone(),
        codec: codec.clone(),
    });

    let shutdown = ShutdownCoordinator::new();
    let scheduler = Arc::new(Scheduler::new(
        SchedulerSettings {
            server_name: config.agent.server_name.clone(),
            startup_interval: config.startup_interval(),
            tick_interval: config.tick_interval(),
        },
        inventory.clone(),
        log.clone(),
        runner,
        Watchdog::new(config.run_ceiling()),
        &shutdown.token(),
    ));

    if let Some(target_id) = args.run_once {
        let signals = {
            let coordinator = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.wait_for_signal().await {
                    tracing::error!("Signal handler failed: {}", e);
                }
            })
        };
        let result = scheduler.run_forced(&target_id).await;
        signals.abort();
        return result.with_context(|| format!("Replication of target {} failed", target_id));
    }

    let mut tasks = Vec::new();

    if config.listener.enabled {
        let listener = tokio::net::TcpListener::bind(&config.listener.bind)
            .await
            .with_context(|| format!("Failed to bind replication listener on {}", config.listener.bind))?;
        let context = Arc::new(ReceiverContext {
            inventory: inventory.clone(),
            codec,
            exclusions: config.exclusions(),
            data_dir: config.agent.data_dir.clone(),
            verify_content: config.receiver.verify_content,
        });
        let token = shutdown.token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve(listener, context, token).await {
                tracing::error!("Replication listener failed: {}", e);
            }
        }));
    }

    let triggers = if config.scheduler.enabled {
        let handle = scheduler.handle();
        tasks.push(scheduler.start().await?);
        Some(handle)
    } else {
        tracing::info!("Scheduler disabled; this agent only receives");
        None
    };

    if config.api.enabled {
        let state = Arc::new(ApiState {
            server_name: config.agent.server_name.clone(),
            inventory,
            log,
            triggers,
            started_at: Instant::now(),
        });
        let app = api::create_router(state);
        let listener = tokio::net::TcpListener::bind(&config.api.bind)
            .await
            .with_context(|| format!("Failed to bind API on {}", config.api.bind))?;
        tracing::info!("Status API listening on http://{}", config.api.bind);

        let token = shutdown.token();
        tasks.push(tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("API server error: {}", e);
            }
        }));
    }

    // Wait for shutdown signal
    shutdown.wait_for_signal().await?;
    scheduler.stop();

    for task in tasks {
        match tokio::time::timeout(Duration::from_secs(10), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Task panicked during shutdown: {}", e),
            Err(_) => tracing::warn!("Task shutdown timeout, forcing exit"),
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
