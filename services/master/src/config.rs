use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Master configuration, loaded from `DEVLAB_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Optional JSON file describing team pools.
    pub teams_file: Option<PathBuf>,

    /// Timeout for calls to host agents. Must cover driver startup.
    pub agent_request_timeout: Duration,

    pub allocation: AllocationConfig,
    pub reaper: ReaperConfig,
}

/// Polling allocator settings.
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub max_timeout: Duration,

    /// Port every host agent listens on.
    pub agent_port: u16,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(900),
            max_timeout: Duration::from_secs(3600),
            agent_port: 5252,
        }
    }
}

impl AllocationConfig {
    /// Resolve a caller-supplied timeout. Unset or negative means the
    /// default; anything above the maximum is capped.
    pub fn effective_timeout(&self, requested_secs: Option<i64>) -> Duration {
        match requested_secs {
            Some(secs) if secs >= 0 => Duration::from_secs(secs as u64).min(self.max_timeout),
            _ => self.default_timeout.min(self.max_timeout),
        }
    }
}

/// Session reaper schedules and thresholds.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub unreachable_interval: Duration,
    pub long_running_interval: Duration,
    pub dead_session_interval: Duration,

    /// Busy sessions older than this are force-released.
    pub max_session: Duration,

    /// Sessions younger than this are never treated as dead.
    pub dead_session_grace: Duration,

    pub probe_timeout: Duration,
    pub agent_port: u16,

    /// Enables the unreachable-host sweep.
    pub maintenance_enabled: bool,

    /// Enables the long-running and dead-session sweeps.
    pub reap_sessions_enabled: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            unreachable_interval: Duration::from_secs(300),
            long_running_interval: Duration::from_secs(600),
            dead_session_interval: Duration::from_secs(300),
            max_session: Duration::from_secs(3600),
            dead_session_grace: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(2),
            agent_port: 5252,
            maintenance_enabled: true,
            reap_sessions_enabled: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DEVLAB_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("DEVLAB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let teams_file = std::env::var("DEVLAB_TEAMS_FILE").ok().map(PathBuf::from);

        let agent_port = env_parse("DEVLAB_AGENT_PORT", 5252u16)?;

        let allocation = AllocationConfig {
            poll_interval: env_nonzero_secs("DEVLAB_POLL_INTERVAL_SECS", 5)?,
            default_timeout: env_secs("DEVLAB_DEFAULT_TIMEOUT_SECS", 900)?,
            max_timeout: env_secs("DEVLAB_MAX_TIMEOUT_SECS", 3600)?,
            agent_port,
        };

        let reaper = ReaperConfig {
            unreachable_interval: env_nonzero_secs("DEVLAB_REAP_UNREACHABLE_INTERVAL_SECS", 300)?,
            long_running_interval: env_nonzero_secs("DEVLAB_REAP_LONG_RUNNING_INTERVAL_SECS", 600)?,
            dead_session_interval: env_nonzero_secs("DEVLAB_REAP_DEAD_SESSIONS_INTERVAL_SECS", 300)?,
            max_session: env_nonzero_secs("DEVLAB_MAX_SESSION_SECS", 3600)?,
            dead_session_grace: env_secs("DEVLAB_DEAD_SESSION_GRACE_SECS", 120)?,
            probe_timeout: Duration::from_secs(2),
            agent_port,
            maintenance_enabled: env_flag("DEVLAB_MAINTENANCE_ENABLED", true),
            reap_sessions_enabled: env_flag("DEVLAB_REAP_SESSIONS_ENABLED", true),
        };

        let agent_request_timeout = env_nonzero_secs("DEVLAB_AGENT_REQUEST_TIMEOUT_SECS", 90)?;

        Ok(Self {
            listen_addr,
            log_level,
            teams_file,
            agent_request_timeout,
            allocation,
            reaper,
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

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    env_parse(name, default).map(Duration::from_secs)
}

/// Like `env_secs`, for settings where zero would spin a loop or time out
/// every call.
fn env_nonzero_secs(name: &str, default: u64) -> Result<Duration> {
    env_secs(name, default).and_then(|value| nonzero(name, value))
}

fn nonzero(name: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        bail!("{name} must be greater than zero");
    }
    Ok(value)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
