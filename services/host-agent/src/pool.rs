//! Port/process pool manager.
//!
//! Each device with a driver owns a slot: its ports, its lifecycle state and
//! a generation number. A slot moves `Starting → Ready → Stopping` and is
//! removed once its processes are gone; having no slot is the idle state.
//!
//! One lock serializes every change to the pool. Launching a process and
//! waiting for it to answer happen outside the lock once the port is
//! reserved, so a stop may land in between. The start notices through the
//! generation and gives up without marking the slot ready.

use std::collections::HashMap;
use std::sync::Arc;

use devlab_model::{DriverState, LiveBinding};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::PoolConfig;
use crate::driver::{DriverRuntime, LaunchSpec};
use crate::ports::{PortAssignment, PortError, PortPool};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("device {device_id} already has a driver on port {port}")]
    AlreadyBound { device_id: String, port: u16 },

    #[error("failed to launch driver for device {device_id}: {message}")]
    Launch { device_id: String, message: String },

    #[error("driver for device {device_id} did not become healthy within {secs} seconds")]
    Unhealthy { device_id: String, secs: u64 },

    #[error("failed to stop driver for device {device_id}: {message}")]
    Kill { device_id: String, message: String },
}

impl PoolError {
    /// Whether the host is out of driver capacity.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Ports(PortError::Exhausted { .. }))
    }
}

/// A device's driver request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub device_id: String,
    pub is_android: bool,
    pub request_id: String,
    pub browser_version: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    ports: PortAssignment,
    state: DriverState,
    generation: u64,
}

struct PoolState {
    ports: PortPool,
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

pub struct PoolManager {
    host_ip: String,
    config: PoolConfig,
    runtime: Arc<dyn DriverRuntime>,
    state: Mutex<PoolState>,
}

impl PoolManager {
    /// Build the pool. Fails if the port layout is invalid.
    pub fn new(
        host_ip: impl Into<String>,
        config: PoolConfig,
        runtime: Arc<dyn DriverRuntime>,
    ) -> Result<Self, PoolError> {
        let ports = PortPool::new(config.port_start, config.port_count)?;
        Ok(Self {
            host_ip: host_ip.into(),
            config,
            runtime,
            state: Mutex::new(PoolState {
                ports,
                slots: HashMap::new(),
                next_generation: 0,
            }),
        })
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    /// Start a driver for a device that has none.
    ///
    /// Returns the session URL once the driver answers, or `None` when a
    /// stop for the device landed while the driver was coming up.
    #[instrument(skip(self, request), fields(device_id = %request.device_id, request_id = %request.request_id))]
    pub async fn start(&self, request: &StartRequest) -> Result<Option<String>, PoolError> {
        let (ports, generation) = {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.slots.get(&request.device_id) {
                return Err(PoolError::AlreadyBound {
                    device_id: request.device_id.clone(),
                    port: slot.ports.driver,
                });
            }

            let port = state.ports.take()?;
            let ports = PortAssignment::new(port, request.is_android);
            state.next_generation += 1;
            let generation = state.next_generation;
            state.slots.insert(
                request.device_id.clone(),
                Slot {
                    ports,
                    state: DriverState::Starting,
                    generation,
                },
            );
            (ports, generation)
        };

        info!(port = ports.driver, "Port reserved, launching driver");

        let spec = LaunchSpec {
            device_id: request.device_id.clone(),
            is_android: request.is_android,
            request_id: request.request_id.clone(),
            browser_version: request.browser_version.clone(),
            ports,
        };
        if let Err(e) = self.runtime.launch(&spec).await {
            warn!(error = %e, "Driver launch failed");
            self.abandon(&request.device_id, generation).await;
            return Err(PoolError::Launch {
                device_id: request.device_id.clone(),
                message: e.to_string(),
            });
        }

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if !self.is_current(&request.device_id, generation).await {
                info!("Driver start superseded by a stop");
                return Ok(None);
            }
            if self.runtime.is_healthy(ports.driver).await {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    port = ports.driver,
                    timeout_secs = self.config.startup_timeout.as_secs(),
                    "Driver did not become healthy in time"
                );
                self.abandon(&request.device_id, generation).await;
                return Err(PoolError::Unhealthy {
                    device_id: request.device_id.clone(),
                    secs: self.config.startup_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.health_poll_interval.min(deadline - now)).await;
        }

        let mut state = self.state.lock().await;
        match state.slots.get_mut(&request.device_id) {
            Some(slot) if slot.generation == generation => slot.state = DriverState::Ready,
            _ => {
                info!("Driver start superseded by a stop");
                return Ok(None);
            }
        }

        info!(port = ports.driver, "Driver ready");
        Ok(Some(format!("http://{}:{}/wd/hub", self.host_ip, ports.driver)))
    }

    /// Kill the device's driver and free its port.
    ///
    /// Returns false when the device had no driver. If the kill fails the
    /// slot stays `Stopping` and keeps its port until a later stop succeeds.
    #[instrument(skip(self))]
    pub async fn stop(&self, device_id: &str) -> Result<bool, PoolError> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state, device_id).await
    }

    /// Stop twice, then start.
    pub async fn restart(&self, request: &StartRequest) -> Result<Option<String>, PoolError> {
        if let Err(e) = self.stop(&request.device_id).await {
            warn!(device_id = %request.device_id, error = %e, "First stop before restart failed, retrying");
        }
        self.stop(&request.device_id).await?;
        self.start(request).await
    }

    /// Every device currently holding a port.
    pub async fn bindings(&self) -> Vec<LiveBinding> {
        let state = self.state.lock().await;
        let mut bindings: Vec<LiveBinding> = state
            .slots
            .iter()
            .map(|(device_id, slot)| LiveBinding {
                device_id: device_id.clone(),
                port: slot.ports.driver,
                state: slot.state,
            })
            .collect();
        bindings.sort_by_key(|b| b.port);
        bindings
    }

    pub async fn available_ports(&self) -> usize {
        self.state.lock().await.ports.available()
    }

    /// Kill driver processes left behind by an earlier agent.
    pub async fn kill_leftovers(&self) -> anyhow::Result<()> {
        let _state = self.state.lock().await;
        self.runtime.kill_all().await
    }

    async fn is_current(&self, device_id: &str, generation: u64) -> bool {
        self.state
            .lock()
            .await
            .slots
            .get(device_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Tear down a start that failed, unless its slot was already replaced.
    async fn abandon(&self, device_id: &str, generation: u64) {
        let mut state = self.state.lock().await;
        let current = state
            .slots
            .get(device_id)
            .is_some_and(|slot| slot.generation == generation);
        if !current {
            return;
        }
        if let Err(e) = self.stop_locked(&mut state, device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to clean up after failed start");
        }
    }

    async fn stop_locked(&self, state: &mut PoolState, device_id: &str) -> Result<bool, PoolError> {
        let Some(slot) = state.slots.get_mut(device_id) else {
            return Ok(false);
        };
        slot.state = DriverState::Stopping;
        let ports = slot.ports;

        self.runtime
            .kill(device_id, &ports)
            .await
            .map_err(|e| PoolError::Kill {
                device_id: device_id.to_string(),
                message: e.to_string(),
            })?;

        state.slots.remove(device_id);
        state.ports.give_back(ports.driver);
        info!(device_id = %device_id, port = ports.driver, "Driver stopped, port released");
        Ok(true)
    }
}
