//! Configuration for the host agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,

    /// Address the master and test clients reach this host on. Goes into
    /// every session URL.
    pub host_ip: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub pool: PoolConfig,
    pub driver: DriverConfig,
    pub logs: LogRetentionConfig,
    pub runtime: RuntimeKind,
}

/// Port pool and startup settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub port_start: u16,
    pub port_count: u16,

    /// How long a freshly launched driver has to answer its status endpoint.
    pub startup_timeout: Duration,

    /// Delay between status checks while waiting for a driver.
    pub health_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_start: 4723,
            port_count: 30,
            startup_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How driver processes are launched.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub binary: String,
    pub log_dir: PathBuf,
}

/// Cleanup of old driver session logs.
#[derive(Debug, Clone)]
pub struct LogRetentionConfig {
    /// Logs untouched for this long are deleted.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for LogRetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Which `DriverRuntime` backs the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Process,
    Mock,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown driver runtime {other:?}, expected process or mock"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DEVLAB_AGENT_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5252".to_string())
            .parse::<SocketAddr>()
            .context("invalid DEVLAB_AGENT_LISTEN_ADDR")?;

        let host_ip = std::env::var("DEVLAB_HOST_IP").unwrap_or_else(|_| "127.0.0.1".to_string());

        let log_level = std::env::var("DEVLAB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let pool = PoolConfig {
            port_start: env_parse("DEVLAB_DRIVER_PORT_START", 4723u16)?,
            port_count: env_parse("DEVLAB_DRIVER_PORT_COUNT", 30u16)?,
            startup_timeout: Duration::from_secs(env_parse(
                "DEVLAB_DRIVER_STARTUP_TIMEOUT_SECS",
                60u64,
            )?),
            ..Default::default()
        };

        let driver = DriverConfig {
            binary: std::env::var("DEVLAB_DRIVER_BINARY").unwrap_or_else(|_| "appium".to_string()),
            log_dir: std::env::var("DEVLAB_DRIVER_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("devlab-driver-logs")),
        };

        let logs = LogRetentionConfig {
            retention: env_nonzero_secs("DEVLAB_DRIVER_LOG_RETENTION_SECS", 24 * 60 * 60)?,
            sweep_interval: env_nonzero_secs("DEVLAB_DRIVER_LOG_SWEEP_INTERVAL_SECS", 60 * 60)?,
        };

        let runtime = std::env::var("DEVLAB_DRIVER_RUNTIME")
            .map(|raw| raw.parse::<RuntimeKind>())
            .unwrap_or(Ok(RuntimeKind::Process))?;

        Ok(Self {
            listen_addr,
            host_ip,
            log_level,
            pool,
            driver,
            logs,
            runtime,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_nonzero_secs(name: &str, default: u64) -> Result<Duration> {
    let secs = env_parse(name, default)?;
    if secs == 0 {
        anyhow::bail!("{name} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
