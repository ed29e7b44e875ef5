//! Driver process runtime.
//!
//! The runtime interface abstracts what the pool manager does to driver
//! processes:
//! - launching one for a device on a set of ports
//! - killing the processes that belong to a device
//! - checking whether a driver answers its status endpoint
//!
//! `ProcessRuntime` spawns real processes and keeps the `Child` of each
//! one, so a kill only ever reaches the process it launched for that
//! device. `MockRuntime` is provided for development and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::ports::PortAssignment;

/// Marker argument on every driver command line this agent spawns, so
/// leftovers from an earlier agent can be found.
const AGENT_MARKER: &str = "--relaxed-security";

/// Everything needed to launch one driver process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub device_id: String,
    pub is_android: bool,
    pub request_id: String,
    pub browser_version: Option<String>,
    pub ports: PortAssignment,
}

/// Driver runtime interface.
#[async_trait]
pub trait DriverRuntime: Send + Sync {
    /// Start the driver process. Returns once the process is spawned, not
    /// once it is serving.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Kill every process belonging to `device_id`. Killing nothing is not
    /// an error.
    async fn kill(&self, device_id: &str, ports: &PortAssignment) -> Result<()>;

    /// Kill every driver process this agent could have spawned.
    async fn kill_all(&self) -> Result<()>;

    /// Whether the driver on `port` answers its status endpoint.
    async fn is_healthy(&self, port: u16) -> bool;
}

/// Path of the log file for one driver session.
pub fn log_file(log_dir: &std::path::Path, device_id: &str, request_id: &str) -> PathBuf {
    log_dir.join(device_id).join(format!("{request_id}.log"))
}

/// Spawns driver processes with `tokio::process`.
pub struct ProcessRuntime {
    config: DriverConfig,
    client: reqwest::Client,

    /// Live driver processes by device id.
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessRuntime {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("failed to build health check client")?;
        Ok(Self {
            config,
            client,
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the process launched for `device_id` is still running.
    pub async fn is_running(&self, device_id: &str) -> bool {
        let mut children = self.children.lock().await;
        children
            .get_mut(device_id)
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn command_args(&self, spec: &LaunchSpec, log_path: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            spec.ports.driver.to_string(),
            "--log".to_string(),
            log_path.display().to_string(),
            "--log-timestamp".to_string(),
            "--session-override".to_string(),
            AGENT_MARKER.to_string(),
        ];

        if let Some(port) = spec.ports.bootstrap {
            args.extend(["--bootstrap-port".to_string(), port.to_string()]);
        }
        if let Some(port) = spec.ports.chromedriver {
            args.extend(["--chromedriver-port".to_string(), port.to_string()]);
        }
        if let Some(port) = spec.ports.webkit_proxy {
            args.extend(["--webkit-debug-proxy-port".to_string(), port.to_string()]);
        }

        let mut capabilities = json!({ "udid": spec.device_id });
        if let Some(version) = &spec.browser_version {
            capabilities["browserVersion"] = json!(version);
        }
        args.extend(["--default-capabilities".to_string(), capabilities.to_string()]);
        args
    }

    /// Kill `child` and everything in its process group, then reap it.
    async fn terminate(device_id: &str, child: &mut Child) -> Result<()> {
        if child
            .try_wait()
            .context("failed to check driver process")?
            .is_some()
        {
            debug!(device_id = %device_id, "Driver process already exited");
            return Ok(());
        }

        // Drivers spawn helpers (chromedriver, proxies) into their group.
        if let Some(pid) = child.id() {
            let group = Command::new("kill")
                .args(["-KILL", "--", &format!("-{pid}")])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = group {
                debug!(device_id = %device_id, pid, error = %e, "Failed to signal driver process group");
            }
        }

        child
            .kill()
            .await
            .with_context(|| format!("failed to kill driver process for device {device_id}"))
    }

    /// Run `pkill -f pattern`. Exit status 1 means nothing matched.
    async fn pkill(&self, pattern: &str) -> Result<()> {
        let status = Command::new("pkill")
            .arg("-f")
            .arg(pattern)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to run pkill")?;

        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => anyhow::bail!("pkill -f {pattern:?} exited with {status}"),
        }
    }
}

#[async_trait]
impl DriverRuntime for ProcessRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let log_path = log_file(&self.config.log_dir, &spec.device_id, &spec.request_id);
        if let Some(dir) = log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }

        let args = self.command_args(spec, &log_path);
        info!(
            device_id = %spec.device_id,
            port = spec.ports.driver,
            log = %log_path.display(),
            "Launching driver process"
        );

        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut children = self.children.lock().await;
        if let Some(mut previous) = children.remove(&spec.device_id) {
            warn!(device_id = %spec.device_id, "Replacing a driver process that was never killed");
            Self::terminate(&spec.device_id, &mut previous).await?;
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.binary))?;
        debug!(device_id = %spec.device_id, pid = ?child.id(), "Driver process spawned");
        children.insert(spec.device_id.clone(), child);

        Ok(())
    }

    async fn kill(&self, device_id: &str, ports: &PortAssignment) -> Result<()> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(device_id) else {
            debug!(device_id = %device_id, "No driver process to kill");
            return Ok(());
        };

        debug!(device_id = %device_id, port = ports.driver, pid = ?child.id(), "Killing driver process");
        Self::terminate(device_id, child).await?;
        children.remove(device_id);
        Ok(())
    }

    async fn kill_all(&self) -> Result<()> {
        let mut children = self.children.lock().await;
        for (device_id, mut child) in children.drain() {
            if let Err(e) = Self::terminate(&device_id, &mut child).await {
                warn!(device_id = %device_id, error = %e, "Failed to kill driver process");
            }
        }
        // Leftovers from an earlier agent run are only findable by command line.
        self.pkill(&format!("{}.*{}", self.config.binary, AGENT_MARKER))
            .await
    }

    async fn is_healthy(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/wd/hub/status");
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(port, error = %e, "Driver status check failed");
                false
            }
        }
    }
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    launches: AtomicU64,
    kills: AtomicU64,

    /// Whether launches should fail.
    fail_launches: bool,

    healthy: AtomicBool,
    fail_kills: AtomicBool,
}

impl MockRuntime {
    /// A runtime whose drivers come up healthy immediately.
    pub fn new() -> Self {
        Self {
            launches: AtomicU64::new(0),
            kills: AtomicU64::new(0),
            fail_launches: false,
            healthy: AtomicBool::new(true),
            fail_kills: AtomicBool::new(false),
        }
    }

    /// A runtime that fails every launch.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new()
        }
    }

    /// A runtime whose drivers never answer their status endpoint.
    pub fn unhealthy() -> Self {
        let runtime = Self::new();
        runtime.set_healthy(false);
        runtime
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_kills(&self, fail: bool) {
        self.fail_kills.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> u64 {
        self.kills.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverRuntime for MockRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        if self.fail_launches {
            anyhow::bail!("Mock runtime configured to fail");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(
            device_id = %spec.device_id,
            port = spec.ports.driver,
            "[MOCK] Launching driver"
        );
        Ok(())
    }

    async fn kill(&self, device_id: &str, ports: &PortAssignment) -> Result<()> {
        if self.fail_kills.load(Ordering::SeqCst) {
            anyhow::bail!("Mock runtime configured to fail kills");
        }
        self.kills.fetch_add(1, Ordering::SeqCst);
        info!(device_id = %device_id, port = ports.driver, "[MOCK] Killing driver");
        Ok(())
    }

    async fn kill_all(&self) -> Result<()> {
        info!("[MOCK] Killing all drivers");
        Ok(())
    }

    async fn is_healthy(&self, port: u16) -> bool {
        debug!(port, "[MOCK] Checking driver health");
        self.healthy.load(Ordering::SeqCst)
    }
}
