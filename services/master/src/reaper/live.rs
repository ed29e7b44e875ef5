use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::hosts::DriverControl;

/// Device ids bound to a live driver, per host. Hosts that could not be
/// asked are absent, which is different from an empty set.
pub type LiveSessions = HashMap<String, HashSet<String>>;

/// Ground truth for which devices are really in a session.
#[async_trait]
pub trait LiveSessionSource: Send + Sync {
    async fn live_sessions(&self, hosts: &[String]) -> LiveSessions;
}

/// Asks each host agent for its driver bindings.
pub struct AgentLiveSessions {
    drivers: Arc<dyn DriverControl>,
}

impl AgentLiveSessions {
    pub fn new(drivers: Arc<dyn DriverControl>) -> Self {
        Self { drivers }
    }
}

#[async_trait]
impl LiveSessionSource for AgentLiveSessions {
    async fn live_sessions(&self, hosts: &[String]) -> LiveSessions {
        let mut sessions = LiveSessions::new();
        for host in hosts {
            match self.drivers.live_bindings(host).await {
                Ok(response) => {
                    sessions.insert(
                        host.clone(),
                        response.bindings.into_iter().map(|b| b.device_id).collect(),
                    );
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Could not fetch live driver bindings");
                }
            }
        }
        sessions
    }
}
