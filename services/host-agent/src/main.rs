//! devlab host agent binary.

use std::sync::Arc;

use anyhow::Result;
use devlab_host_agent::{
    api,
    config::{Config, RuntimeKind},
    driver::{DriverRuntime, MockRuntime, ProcessRuntime},
    logs::LogJanitor,
    pool::PoolManager,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DEVLAB_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host_ip = %config.host_ip,
        port_start = config.pool.port_start,
        port_count = config.pool.port_count,
        "Starting devlab host agent"
    );

    let runtime: Arc<dyn DriverRuntime> = match config.runtime {
        RuntimeKind::Process => Arc::new(ProcessRuntime::new(config.driver.clone())?),
        RuntimeKind::Mock => {
            warn!("Using mock driver runtime, no processes will be spawned");
            Arc::new(MockRuntime::new())
        }
    };

    let pool = Arc::new(PoolManager::new(
        config.host_ip.clone(),
        config.pool.clone(),
        runtime,
    )?);

    if let Err(e) = pool.kill_leftovers().await {
        warn!(error = %e, "Failed to kill leftover driver processes");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let janitor = LogJanitor::new(config.driver.log_dir.clone(), config.logs.clone());
    let janitor_handle = tokio::spawn(async move {
        janitor.run(shutdown_rx).await;
    });

    let state = api::AppState::new(Arc::clone(&pool), config.driver.log_dir.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(10), janitor_handle).await {
        warn!(error = %e, "Log retention worker did not shut down in time");
    }

    info!("Host agent shutdown complete");
    Ok(())
}
