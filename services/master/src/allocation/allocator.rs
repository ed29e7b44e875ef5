use std::sync::Arc;

use chrono::{DateTime, Utc};
use devlab_model::{
    Device, DeviceAction, DeviceRequest, DeviceRestrictionRequest, SessionDescriptor,
    StartDriverRequest,
};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{matcher, AllocationCoordinator, AllocationError, AllocationResult, SessionContext};
use crate::config::AllocationConfig;
use crate::hosts::DriverControl;
use crate::store::TeamDirectory;

type ResultSlot = Arc<Mutex<Option<oneshot::Sender<AllocationResult<SessionDescriptor>>>>>;

/// A device this allocator claimed and started a driver for.
struct Claimed {
    session: SessionDescriptor,
    allocation_start: Option<DateTime<Utc>>,
}

/// Turns device requests into held devices with a running driver.
pub struct Allocator {
    coordinator: Arc<AllocationCoordinator>,
    drivers: Arc<dyn DriverControl>,
    teams: Arc<TeamDirectory>,
    config: AllocationConfig,
}

impl Allocator {
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        drivers: Arc<dyn DriverControl>,
        teams: Arc<TeamDirectory>,
        config: AllocationConfig,
    ) -> Self {
        Self {
            coordinator,
            drivers,
            teams,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<AllocationCoordinator> {
        &self.coordinator
    }

    /// Allocate a device matching `request`, waiting up to the timeout.
    ///
    /// A poll task and a timer task race to fill one result slot; whichever
    /// gets there first decides the outcome. A device claimed by the poll
    /// task after the timer won is released again.
    #[instrument(skip(self, request, ctx), fields(request_id = %ctx.request_id))]
    pub async fn allocate(
        self: &Arc<Self>,
        request: DeviceRequest,
        timeout_secs: Option<i64>,
        ctx: SessionContext,
    ) -> AllocationResult<SessionDescriptor> {
        validate(&request)?;

        let ctx = SessionContext {
            team: ctx.team.or_else(|| request.team.clone()),
            job_link: ctx.job_link.or_else(|| request.job_link.clone()),
            ..ctx
        };
        let request = DeviceRequest {
            team: ctx.team.clone(),
            job_link: ctx.job_link.clone(),
            ..request
        };

        let timeout = self.config.effective_timeout(timeout_secs);
        let started = Instant::now();
        let deadline = started + timeout;
        info!(request = %request, timeout_secs = timeout.as_secs(), "Allocation requested");

        let (tx, rx) = oneshot::channel();
        let slot: ResultSlot = Arc::new(Mutex::new(Some(tx)));

        let timer = tokio::spawn({
            let slot = Arc::clone(&slot);
            let summary = request.to_string();
            async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(tx) = slot.lock().await.take() {
                    let elapsed_secs = started.elapsed().as_secs();
                    warn!(request = %summary, elapsed_secs, "Allocation timed out");
                    let _ = tx.send(Err(AllocationError::Timeout {
                        request: summary,
                        elapsed_secs,
                    }));
                }
            }
        });

        tokio::spawn({
            let this = Arc::clone(self);
            let slot = Arc::clone(&slot);
            async move {
                this.poll_until(request, ctx, deadline, slot).await;
            }
        });

        let result = rx.await.map_err(|_| AllocationError::Abandoned)?;
        timer.abort();
        result
    }

    async fn poll_until(
        &self,
        request: DeviceRequest,
        ctx: SessionContext,
        deadline: Instant,
        slot: ResultSlot,
    ) {
        loop {
            if is_resolved(&slot).await {
                debug!(request_id = %ctx.request_id, "Allocation already resolved, stopping poll");
                return;
            }

            match self.try_allocate(&request, &ctx).await {
                Ok(Some(claimed)) => {
                    self.deliver(&slot, claimed).await;
                    return;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(request_id = %ctx.request_id, error = %e, "Transient allocation failure, retrying");
                }
                Err(e) => {
                    if let Some(tx) = slot.lock().await.take() {
                        let _ = tx.send(Err(e));
                    }
                    return;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// One matching attempt: claim the first matching device that is still
    /// free and start its driver.
    async fn try_allocate(
        &self,
        request: &DeviceRequest,
        ctx: &SessionContext,
    ) -> AllocationResult<Option<Claimed>> {
        let snapshot = self.coordinator.store().find_all().await?;
        let pool = matcher::team_pool(request, snapshot, &self.teams);

        for candidate in matcher::matching(request, &pool) {
            if !self
                .coordinator
                .transition(&candidate.id, &candidate.host, DeviceAction::Busy, ctx)
                .await?
            {
                continue;
            }

            let allocation_start = self
                .coordinator
                .store()
                .find(&candidate.id, &candidate.host)
                .await?
                .and_then(|d| d.allocation_start);

            let start = StartDriverRequest {
                device_id: candidate.id.clone(),
                is_android: candidate.is_android,
                request_id: ctx.request_id.clone(),
                browser_version: request.browser_version.clone(),
            };
            let response = match self.drivers.start_driver(&candidate.host, &start).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        device_id = %candidate.id,
                        host = %candidate.host,
                        error = %e,
                        "Driver start failed, device stays busy until reaped"
                    );
                    return Err(e.into());
                }
            };

            return Ok(Some(Claimed {
                session: self.describe(candidate, response.session_url, &ctx.request_id),
                allocation_start,
            }));
        }

        Ok(None)
    }

    async fn deliver(&self, slot: &ResultSlot, claimed: Claimed) {
        let sender = slot.lock().await.take();
        let Claimed {
            session,
            allocation_start,
        } = claimed;

        let undelivered = match sender {
            Some(tx) => tx.send(Ok(session)).err().and_then(Result::ok),
            None => Some(session),
        };

        if let Some(session) = undelivered {
            self.discard(session, allocation_start).await;
        }
    }

    /// Give back a device whose claim nobody is waiting for anymore.
    async fn discard(&self, session: SessionDescriptor, allocation_start: Option<DateTime<Utc>>) {
        info!(
            device_id = %session.device_id,
            host = %session.host,
            "Allocation result arrived after the caller gave up, releasing device"
        );

        if let Err(e) = self
            .drivers
            .stop_driver(&session.host, &session.device_id)
            .await
        {
            warn!(device_id = %session.device_id, error = %e, "Failed to stop driver of discarded session");
        }

        let released = self
            .coordinator
            .release_if(&session.device_id, &session.host, |d| {
                d.allocation_start == allocation_start
            })
            .await;
        if let Err(e) = released {
            warn!(device_id = %session.device_id, error = %e, "Failed to release discarded device");
        }
    }

    fn describe(&self, device: &Device, session_url: String, request_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            device_id: device.id.clone(),
            device_name: device.display_name().to_string(),
            is_android: device.is_android,
            is_real_device: device.is_real_device,
            os_version: device.os_version.clone(),
            host: device.host.clone(),
            session_url,
            logs_url: format!(
                "http://{}:{}/driver/logs/{}/{}.log",
                device.host, self.config.agent_port, device.id, request_id
            ),
        }
    }

    /// Release busy devices and stop their drivers.
    ///
    /// With no restriction every busy device is released. A restriction
    /// must carry at least one field. Every matching device is attempted.
    /// A device whose driver cannot be stopped stays busy, and the call then
    /// fails with `PartialRelease` listing what was released.
    #[instrument(skip(self, restriction, ctx), fields(request_id = %ctx.request_id))]
    pub async fn unallocate(
        &self,
        restriction: Option<&DeviceRestrictionRequest>,
        ctx: &SessionContext,
    ) -> AllocationResult<Vec<Device>> {
        if restriction.is_some_and(DeviceRestrictionRequest::is_empty) {
            return Err(AllocationError::Validation(
                "at least one restriction field is required".to_string(),
            ));
        }

        let store = self.coordinator.store();
        let busy: Vec<Device> = store
            .find_all()
            .await?
            .into_iter()
            .filter(|d| d.is_busy())
            .filter(|d| restriction.is_none_or(|r| matcher::matches_restriction(r, d)))
            .collect();

        let mut released = Vec::with_capacity(busy.len());
        let mut failures = Vec::new();
        for device in busy {
            if let Err(e) = self.drivers.stop_driver(&device.host, &device.id).await {
                warn!(device_id = %device.id, host = %device.host, error = %e, "Failed to stop driver, device stays busy");
                failures.push(e);
                continue;
            }
            if self
                .coordinator
                .transition(&device.id, &device.host, DeviceAction::Free, ctx)
                .await?
            {
                if let Some(updated) = store.find(&device.id, &device.host).await? {
                    released.push(updated);
                }
            }
        }

        info!(
            released = released.len(),
            failed = failures.len(),
            "Unallocate complete"
        );
        if failures.is_empty() {
            Ok(released)
        } else {
            Err(AllocationError::PartialRelease { released, failures })
        }
    }

    /// The device `request` would get right now, without claiming it.
    pub async fn preview(
        &self,
        request: &DeviceRequest,
        device_id: Option<&str>,
    ) -> AllocationResult<Option<Device>> {
        validate(request)?;
        let snapshot: Vec<Device> = self
            .coordinator
            .store()
            .find_all()
            .await?
            .into_iter()
            .filter(|d| device_id.is_none_or(|id| d.id == id))
            .collect();
        let pool = matcher::team_pool(request, snapshot, &self.teams);
        Ok(matcher::select(request, &pool).cloned())
    }
}

fn validate(request: &DeviceRequest) -> AllocationResult<()> {
    let has_package = request
        .app_package
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if request.clear_user_data && !has_package {
        return Err(AllocationError::Validation(
            "app_package is required when clear_user_data is set".to_string(),
        ));
    }
    Ok(())
}

async fn is_resolved(slot: &ResultSlot) -> bool {
    slot.lock()
        .await
        .as_ref()
        .is_none_or(oneshot::Sender::is_closed)
}
