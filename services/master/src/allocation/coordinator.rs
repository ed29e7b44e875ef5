use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use devlab_model::{Device, DeviceAction, DeviceRestrictionRequest, InventoryReport, DEFAULT_TEAM};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{matcher, AllocationError, AllocationResult, SessionContext};
use crate::store::DeviceStore;
use crate::usage::UsageRecorder;

/// Counts from applying one inventory report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventoryOutcome {
    pub added: usize,
    pub refreshed: usize,
    pub removed: usize,
}

/// Serializes every device state change.
///
/// Claims, releases, removals, blacklist flips and inventory updates all
/// run under one lock, so a check and the write that depends on it can
/// never interleave with another transition. Reads for matching go to the
/// store directly and are re-validated here before anything is committed.
pub struct AllocationCoordinator {
    store: Arc<dyn DeviceStore>,
    usage: Arc<dyn UsageRecorder>,
    lock: Mutex<()>,
}

impl AllocationCoordinator {
    pub fn new(store: Arc<dyn DeviceStore>, usage: Arc<dyn UsageRecorder>) -> Self {
        Self {
            store,
            usage,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    /// Apply `action` to one device.
    ///
    /// Returns false when the device is unknown, when a claim finds it busy
    /// or blacklisted, or when a release finds it already free.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn transition(
        &self,
        device_id: &str,
        host: &str,
        action: DeviceAction,
        ctx: &SessionContext,
    ) -> AllocationResult<bool> {
        let _guard = self.lock.lock().await;
        match action {
            DeviceAction::Busy => self.claim_locked(device_id, host, ctx).await,
            DeviceAction::Free => self.release_locked(device_id, host, |_| true).await,
            DeviceAction::Remove => self.remove_locked(device_id, host).await,
        }
    }

    /// Release a busy device only if `guard` still holds for its current
    /// record. Lets sweeps re-check what they saw in a snapshot.
    pub async fn release_if<F>(&self, device_id: &str, host: &str, guard: F) -> AllocationResult<bool>
    where
        F: FnOnce(&Device) -> bool + Send,
    {
        let _guard = self.lock.lock().await;
        self.release_locked(device_id, host, guard).await
    }

    /// Flip the blacklist flag on every device selected by `restriction`
    /// that is not already in the target state.
    pub async fn set_blacklisted(
        &self,
        restriction: &DeviceRestrictionRequest,
        blacklisted: bool,
    ) -> AllocationResult<Vec<Device>> {
        if restriction.is_empty() {
            return Err(AllocationError::Validation(
                "at least one restriction field is required".to_string(),
            ));
        }

        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let mut changed = Vec::new();

        for mut device in self.store.find_all().await? {
            if device.blacklisted == blacklisted || !matcher::matches_restriction(restriction, &device)
            {
                continue;
            }
            device.blacklisted = blacklisted;
            device.last_modified = now;
            self.store.save(device.clone()).await?;
            info!(
                device_id = %device.id,
                host = %device.host,
                blacklisted,
                "Device blacklist flag changed"
            );
            changed.push(device);
        }

        Ok(changed)
    }

    /// Bring the store in line with what a host reports as connected.
    ///
    /// New devices enter free. Known devices keep their allocation state.
    /// Devices previously seen on the host but missing from the report are
    /// deleted.
    #[instrument(skip(self, report), fields(host = %report.host))]
    pub async fn apply_inventory(&self, report: &InventoryReport) -> AllocationResult<InventoryOutcome> {
        if report.host.trim().is_empty() {
            return Err(AllocationError::Validation(
                "inventory report is missing the host".to_string(),
            ));
        }
        validate_report(report)?;

        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let known = self.store.find_by_host(&report.host).await?;
        let mut outcome = InventoryOutcome::default();
        let mut reported = HashSet::new();

        for info in report.devices() {
            reported.insert(info.device_id.as_str());
            match known.iter().find(|d| d.id == info.device_id) {
                Some(existing) => {
                    let mut device = existing.clone();
                    device.refresh_from(info, now);
                    self.store.save(device).await?;
                    outcome.refreshed += 1;
                }
                None => {
                    self.store
                        .save(Device::from_info(&report.host, info, now))
                        .await?;
                    outcome.added += 1;
                }
            }
        }

        for gone in known.iter().filter(|d| !reported.contains(d.id.as_str())) {
            if self.store.delete(&gone.id, &gone.host).await? {
                info!(device_id = %gone.id, "Device no longer connected, removed");
                outcome.removed += 1;
            }
        }

        Ok(outcome)
    }

    async fn claim_locked(
        &self,
        device_id: &str,
        host: &str,
        ctx: &SessionContext,
    ) -> AllocationResult<bool> {
        let Some(mut device) = self.store.find(device_id, host).await? else {
            return Ok(false);
        };
        if !device.free || device.blacklisted {
            debug!(device_id = %device_id, "Device no longer claimable");
            return Ok(false);
        }

        let now = Utc::now();
        device.free = false;
        device.allocation_start = Some(now);
        device.allocation_end = None;
        device.allocated_to = Some(ctx.allocated_to());
        device.last_modified = now;
        self.store.save(device).await?;

        self.usage.session_started(ctx.team_or_default()).await;
        info!(device_id = %device_id, host = %host, "Device allocated");
        Ok(true)
    }

    async fn release_locked<F>(&self, device_id: &str, host: &str, guard: F) -> AllocationResult<bool>
    where
        F: FnOnce(&Device) -> bool,
    {
        let Some(mut device) = self.store.find(device_id, host).await? else {
            return Ok(false);
        };
        if device.free || !guard(&device) {
            return Ok(false);
        }

        let now = Utc::now();
        let team = device
            .holder_team()
            .unwrap_or(DEFAULT_TEAM)
            .to_string();
        let duration_ms = device.allocation_start.map(|start| session_millis(start, now));

        device.free = true;
        device.allocated_to = None;
        device.allocation_end = Some(now);
        if duration_ms.is_some() {
            device.last_session_duration_ms = duration_ms;
        }
        device.last_modified = now;
        self.store.save(device).await?;

        if let Some(duration_ms) = duration_ms {
            self.usage.session_ended(&team, duration_ms).await;
        }
        info!(device_id = %device_id, host = %host, duration_ms, "Device released");
        Ok(true)
    }

    async fn remove_locked(&self, device_id: &str, host: &str) -> AllocationResult<bool> {
        let removed = self.store.delete(device_id, host).await?;
        if removed {
            info!(device_id = %device_id, host = %host, "Device removed");
        }
        Ok(removed)
    }
}

fn session_millis(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

/// Reject the whole report before anything is written, so a bad entry
/// never leaves the host half-updated.
fn validate_report(report: &InventoryReport) -> AllocationResult<()> {
    let mut seen = HashSet::new();
    for info in report.devices() {
        let id = info.device_id.trim();
        if id.is_empty() {
            return Err(AllocationError::Validation(
                "inventory report contains a device without a device_id".to_string(),
            ));
        }
        if !seen.insert(id) {
            return Err(AllocationError::Validation(format!(
                "inventory report lists device {id} more than once"
            )));
        }
    }
    Ok(())
}
