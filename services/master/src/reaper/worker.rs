use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use super::{SessionReaper, SweepStats};

/// Runs the reaper sweeps, each in its own task on its own fixed interval,
/// so a sweep stuck on slow hosts never delays the others.
pub struct ReaperWorker {
    reaper: Arc<SessionReaper>,
}

impl ReaperWorker {
    pub fn new(reaper: Arc<SessionReaper>) -> Self {
        Self { reaper }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.reaper.config().clone();
        info!(
            unreachable_interval_secs = config.unreachable_interval.as_secs(),
            long_running_interval_secs = config.long_running_interval.as_secs(),
            dead_session_interval_secs = config.dead_session_interval.as_secs(),
            max_session_secs = config.max_session.as_secs(),
            maintenance_enabled = config.maintenance_enabled,
            reap_sessions_enabled = config.reap_sessions_enabled,
            "Starting reaper worker"
        );

        let mut sweeps = JoinSet::new();
        if config.maintenance_enabled {
            let reaper = Arc::clone(&self.reaper);
            sweeps.spawn(every(
                "unreachable_hosts",
                config.unreachable_interval,
                shutdown.clone(),
                move || {
                    let reaper = Arc::clone(&reaper);
                    async move { reaper.sweep_unreachable_hosts().await }
                },
            ));
        }
        if config.reap_sessions_enabled {
            let reaper = Arc::clone(&self.reaper);
            sweeps.spawn(every(
                "long_running",
                config.long_running_interval,
                shutdown.clone(),
                move || {
                    let reaper = Arc::clone(&reaper);
                    async move { reaper.sweep_long_running(Utc::now()).await }
                },
            ));

            let reaper = Arc::clone(&self.reaper);
            sweeps.spawn(every(
                "dead_sessions",
                config.dead_session_interval,
                shutdown.clone(),
                move || {
                    let reaper = Arc::clone(&reaper);
                    async move { reaper.sweep_dead_sessions(Utc::now()).await }
                },
            ));
        }

        if sweeps.is_empty() {
            while shutdown.changed().await.is_ok() && !*shutdown.borrow() {}
        }

        while let Some(joined) = sweeps.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reaper sweep task failed");
            }
        }
        info!("Reaper worker shutting down");
    }
}

/// Run `sweep` every `period` until shutdown. The first immediate tick is
/// skipped.
async fn every<F, Fut>(
    sweep_name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = SweepStats>,
{
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(sweep = sweep_name, "Sweep loop stopping");
                    break;
                }
            }
        }
    }
}
