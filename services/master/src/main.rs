//! devlab master
//!
//! The master owns the device pool. It serves the allocation API, applies
//! inventory reports from host agents and runs the session reaper.

use std::sync::Arc;

use anyhow::Result;
use devlab_master::{
    allocation::{AllocationCoordinator, Allocator},
    api, config,
    hosts::{DriverControl, HostAgentClient},
    reaper::{AgentLiveSessions, ReaperWorker, SessionReaper, TcpProbe},
    state::AppState,
    store::{InMemoryDeviceStore, TeamDirectory},
    usage::InMemoryUsage,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to DEVLAB_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting devlab master");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let teams = match &config.teams_file {
        Some(path) => {
            let teams = TeamDirectory::from_file(path)?;
            info!(path = %path.display(), teams = teams.len(), "Team pools loaded");
            teams
        }
        None => TeamDirectory::default(),
    };

    let store = Arc::new(InMemoryDeviceStore::new());
    let usage = Arc::new(InMemoryUsage::new());
    let coordinator = Arc::new(AllocationCoordinator::new(store, usage));

    let drivers: Arc<dyn DriverControl> = Arc::new(HostAgentClient::new(
        config.allocation.agent_port,
        config.agent_request_timeout,
    )?);

    let allocator = Arc::new(Allocator::new(
        Arc::clone(&coordinator),
        Arc::clone(&drivers),
        Arc::new(teams),
        config.allocation.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = Arc::new(SessionReaper::new(
        Arc::clone(&coordinator),
        Arc::clone(&drivers),
        Arc::new(TcpProbe::new(
            config.reaper.agent_port,
            config.reaper.probe_timeout,
        )),
        Arc::new(AgentLiveSessions::new(Arc::clone(&drivers))),
        config.reaper.clone(),
    ));
    let reaper_worker = ReaperWorker::new(reaper);
    let reaper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reaper_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(allocator);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, reaper_handle).await {
        warn!(error = %e, "Reaper worker did not shut down in time");
    }

    info!("Master shutdown complete");
    Ok(())
}
