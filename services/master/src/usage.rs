//! Per-team usage accounting.
//!
//! The coordinator emits one increment when a session starts and one when it
//! ends. Reporting the totals is left to whatever consumes the recorder.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

/// Accumulated usage for one team.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub sessions: u64,
    pub total_duration_ms: i64,
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn session_started(&self, team: &str);

    async fn session_ended(&self, team: &str, duration_ms: i64);
}

/// Keeps summaries in memory.
#[derive(Default)]
pub struct InMemoryUsage {
    summaries: RwLock<HashMap<String, UsageSummary>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn summary(&self, team: &str) -> UsageSummary {
        self.summaries
            .read()
            .await
            .get(team)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsage {
    async fn session_started(&self, team: &str) {
        let mut summaries = self.summaries.write().await;
        summaries.entry(team.to_string()).or_default().sessions += 1;
    }

    async fn session_ended(&self, team: &str, duration_ms: i64) {
        let mut summaries = self.summaries.write().await;
        summaries
            .entry(team.to_string())
            .or_default()
            .total_duration_ms += duration_ms.max(0);
    }
}
