//! Session reaper.
//!
//! Three independent sweeps keep the device pool honest:
//!
//! - unreachable hosts: devices whose host no longer answers are deleted
//! - long-running sessions: sessions held past the configured maximum are
//!   released
//! - dead sessions: busy devices with no live driver binding on their host
//!   are released
//!
//! Every change goes through the allocation coordinator with a re-check of
//! what the sweep saw, so running a sweep twice on the same state changes
//! nothing the second time. One device failing never stops a sweep.

mod live;
mod probe;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devlab_model::{Device, DeviceAction};
use tracing::{info, instrument, warn};

use crate::allocation::{AllocationCoordinator, SessionContext};
use crate::config::ReaperConfig;
use crate::hosts::DriverControl;

pub use live::{AgentLiveSessions, LiveSessionSource, LiveSessions};
pub use probe::{HostProbe, TcpProbe};
pub use worker::ReaperWorker;

const REAPER_ACTOR: &str = "session-reaper";

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub reaped: usize,
    pub failed: usize,
}

impl SweepStats {
    fn is_noteworthy(&self) -> bool {
        self.reaped > 0 || self.failed > 0
    }
}

pub struct SessionReaper {
    coordinator: Arc<AllocationCoordinator>,
    drivers: Arc<dyn DriverControl>,
    probe: Arc<dyn HostProbe>,
    live: Arc<dyn LiveSessionSource>,
    config: ReaperConfig,
}

impl SessionReaper {
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        drivers: Arc<dyn DriverControl>,
        probe: Arc<dyn HostProbe>,
        live: Arc<dyn LiveSessionSource>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            coordinator,
            drivers,
            probe,
            live,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    async fn snapshot(&self) -> Option<Vec<Device>> {
        match self.coordinator.store().find_all().await {
            Ok(devices) => Some(devices),
            Err(e) => {
                warn!(error = %e, "Failed to read devices for sweep");
                None
            }
        }
    }

    /// Delete every device whose host fails the reachability probe.
    #[instrument(skip(self))]
    pub async fn sweep_unreachable_hosts(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let Some(devices) = self.snapshot().await else {
            stats.failed += 1;
            return stats;
        };

        let mut unreachable = HashSet::new();
        for host in distinct_hosts(&devices) {
            if !self.probe.is_reachable(&host).await {
                warn!(host = %host, "Host unreachable, removing its devices");
                unreachable.insert(host);
            }
        }

        let ctx = SessionContext::system(REAPER_ACTOR);
        for device in &devices {
            stats.examined += 1;
            if !unreachable.contains(&device.host) {
                continue;
            }
            match self
                .coordinator
                .transition(&device.id, &device.host, DeviceAction::Remove, &ctx)
                .await
            {
                Ok(true) => stats.reaped += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(device_id = %device.id, host = %device.host, error = %e, "Failed to remove device");
                    stats.failed += 1;
                }
            }
        }

        if stats.is_noteworthy() {
            info!(
                examined = stats.examined,
                removed = stats.reaped,
                failed = stats.failed,
                "Unreachable-host sweep complete"
            );
        }
        stats
    }

    /// Release sessions held longer than the configured maximum.
    #[instrument(skip(self))]
    pub async fn sweep_long_running(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        let Some(devices) = self.snapshot().await else {
            stats.failed += 1;
            return stats;
        };

        let max_session = self.config.max_session;
        let overdue = move |d: &Device| {
            d.is_busy()
                && d.allocation_end.is_none()
                && d.allocation_start
                    .is_some_and(|start| age_at_least(start, now, max_session))
        };

        for device in devices.iter().filter(|d| d.is_busy()) {
            stats.examined += 1;
            if !overdue(device) {
                continue;
            }

            // The driver goes first. Freeing first would let a new session
            // claim the device and then lose its driver to our stop.
            if !self.still_holds(device).await {
                continue;
            }
            self.stop_driver_quietly(device).await;

            let seen_start = device.allocation_start;
            match self
                .coordinator
                .release_if(&device.id, &device.host, move |d| {
                    overdue(d) && d.allocation_start == seen_start
                })
                .await
            {
                Ok(true) => {
                    stats.reaped += 1;
                    info!(device_id = %device.id, host = %device.host, "Released long-running session");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(device_id = %device.id, host = %device.host, error = %e, "Failed to release long-running session");
                    stats.failed += 1;
                }
            }
        }

        if stats.is_noteworthy() {
            info!(
                examined = stats.examined,
                released = stats.reaped,
                failed = stats.failed,
                "Long-running session sweep complete"
            );
        }
        stats
    }

    /// Release busy devices that have no live driver binding on their host.
    ///
    /// Devices on hosts that could not report their bindings are left
    /// alone, and if no host reports at all the sweep does nothing.
    #[instrument(skip(self))]
    pub async fn sweep_dead_sessions(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        let Some(devices) = self.snapshot().await else {
            stats.failed += 1;
            return stats;
        };

        let busy: Vec<&Device> = devices.iter().filter(|d| d.is_busy()).collect();
        if busy.is_empty() {
            return stats;
        }

        let hosts = distinct_hosts(busy.iter().copied());
        let live = self.live.live_sessions(&hosts).await;
        if live.is_empty() {
            info!("No live session data available, skipping dead-session sweep");
            return stats;
        }

        let grace = self.config.dead_session_grace;
        for device in busy {
            stats.examined += 1;
            if device
                .allocation_start
                .is_some_and(|start| !age_at_least(start, now, grace))
            {
                continue;
            }
            let Some(bound) = live.get(&device.host) else {
                continue;
            };
            if bound.contains(&device.id) {
                continue;
            }

            let seen_start = device.allocation_start;
            match self
                .coordinator
                .release_if(&device.id, &device.host, move |d| {
                    d.is_busy() && d.allocation_start == seen_start
                })
                .await
            {
                Ok(true) => {
                    stats.reaped += 1;
                    info!(device_id = %device.id, host = %device.host, "Released session without a live driver");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(device_id = %device.id, host = %device.host, error = %e, "Failed to release dead session");
                    stats.failed += 1;
                }
            }
        }

        if stats.is_noteworthy() {
            info!(
                examined = stats.examined,
                released = stats.reaped,
                failed = stats.failed,
                "Dead-session sweep complete"
            );
        }
        stats
    }

    /// Whether the device is still held by the session the sweep saw.
    async fn still_holds(&self, seen: &Device) -> bool {
        match self.coordinator.store().find(&seen.id, &seen.host).await {
            Ok(Some(current)) => {
                current.is_busy() && current.allocation_start == seen.allocation_start
            }
            Ok(None) => false,
            Err(e) => {
                warn!(device_id = %seen.id, host = %seen.host, error = %e, "Failed to re-read device");
                false
            }
        }
    }

    async fn stop_driver_quietly(&self, device: &Device) {
        if let Err(e) = self.drivers.stop_driver(&device.host, &device.id).await {
            warn!(device_id = %device.id, host = %device.host, error = %e, "Failed to stop driver of reaped session");
        }
    }
}

fn distinct_hosts<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Vec<String> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.host.as_str()))
        .map(|d| d.host.clone())
        .collect()
}

fn age_at_least(start: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - start).to_std().is_ok_and(|age| age >= limit)
}
