//! Calls from the master to host agents.
//!
//! The master asks a device's host agent to start or stop the driver process
//! bound to that device, and asks for the live driver bindings when looking
//! for dead sessions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use devlab_model::{
    BindingsResponse, DriverState, LiveBinding, StartDriverRequest, StartDriverResponse,
    StopDriverRequest,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum HostError {
    /// The agent could not be reached or did not answer in time.
    #[error("host agent {host} unreachable: {message}")]
    Unreachable { host: String, message: String },

    /// The agent answered with a failure status.
    #[error("host agent {host} rejected request ({status}): {message}")]
    Rejected {
        host: String,
        status: u16,
        message: String,
    },

    /// The agent answered with something we could not decode.
    #[error("host agent {host} sent an invalid response: {message}")]
    Protocol { host: String, message: String },
}

impl HostError {
    /// Worth retrying later: the agent may come back.
    pub fn is_transient(&self) -> bool {
        matches!(self, HostError::Unreachable { .. })
    }

    pub fn host(&self) -> &str {
        match self {
            HostError::Unreachable { host, .. }
            | HostError::Rejected { host, .. }
            | HostError::Protocol { host, .. } => host,
        }
    }

    fn from_reqwest(host: &str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            HostError::Unreachable {
                host: host.to_string(),
                message: err.to_string(),
            }
        } else {
            HostError::Protocol {
                host: host.to_string(),
                message: err.to_string(),
            }
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Driver lifecycle operations on a host agent.
#[async_trait]
pub trait DriverControl: Send + Sync {
    /// Start (or restart) the driver for a device and return its session URL.
    async fn start_driver(
        &self,
        host: &str,
        request: &StartDriverRequest,
    ) -> HostResult<StartDriverResponse>;

    /// Stop the driver for a device. Stopping an idle device succeeds.
    async fn stop_driver(&self, host: &str, device_id: &str) -> HostResult<()>;

    /// Devices currently bound to a driver on the host.
    async fn live_bindings(&self, host: &str) -> HostResult<BindingsResponse>;
}

/// HTTP client for host agents.
pub struct HostAgentClient {
    client: reqwest::Client,
    agent_port: u16,
}

impl HostAgentClient {
    /// `request_timeout` bounds every call and must cover driver startup.
    pub fn new(agent_port: u16, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self { client, agent_port })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.agent_port, path)
    }

    async fn check(host: &str, response: reqwest::Response) -> HostResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(host = %host, status = %status, body = %body, "Host agent request failed");
        Err(HostError::Rejected {
            host: host.to_string(),
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl DriverControl for HostAgentClient {
    async fn start_driver(
        &self,
        host: &str,
        request: &StartDriverRequest,
    ) -> HostResult<StartDriverResponse> {
        let url = self.url(host, "/driver/start");
        debug!(host = %host, device_id = %request.device_id, "Requesting driver start");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| HostError::from_reqwest(host, e))?;
        let response = Self::check(host, response).await?;

        response
            .json::<StartDriverResponse>()
            .await
            .map_err(|e| HostError::Protocol {
                host: host.to_string(),
                message: e.to_string(),
            })
    }

    async fn stop_driver(&self, host: &str, device_id: &str) -> HostResult<()> {
        let url = self.url(host, "/driver/stop");
        debug!(host = %host, device_id = %device_id, "Requesting driver stop");

        let response = self
            .client
            .post(&url)
            .json(&StopDriverRequest {
                device_id: device_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| HostError::from_reqwest(host, e))?;
        Self::check(host, response).await?;
        Ok(())
    }

    async fn live_bindings(&self, host: &str) -> HostResult<BindingsResponse> {
        let url = self.url(host, "/driver/bindings");

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| HostError::from_reqwest(host, e))?;
        let response = Self::check(host, response).await?;

        response
            .json::<BindingsResponse>()
            .await
            .map_err(|e| HostError::Protocol {
                host: host.to_string(),
                message: e.to_string(),
            })
    }
}

/// In-process stand-in for host agents, for development and tests.
///
/// Every start succeeds with a synthetic session URL unless the host was
/// marked unreachable or starts are set to be rejected.
#[derive(Default)]
pub struct MockDriverControl {
    started: Mutex<Vec<(String, StartDriverRequest)>>,
    stopped: Mutex<Vec<(String, String)>>,
    unreachable: RwLock<HashSet<String>>,
    bindings: RwLock<HashMap<String, Vec<String>>>,
    reject_starts: AtomicBool,
    start_delay: Duration,
}

impl MockDriverControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every start take `delay` before answering.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub async fn set_unreachable(&self, host: &str) {
        self.unreachable.write().await.insert(host.to_string());
    }

    pub fn set_reject_starts(&self, reject: bool) {
        self.reject_starts.store(reject, Ordering::SeqCst);
    }

    /// Report `device_ids` as bound on `host`.
    pub async fn set_bindings(&self, host: &str, device_ids: &[&str]) {
        self.bindings.write().await.insert(
            host.to_string(),
            device_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    /// `(host, request)` for every start that reached the mock.
    pub async fn started(&self) -> Vec<(String, StartDriverRequest)> {
        self.started.lock().await.clone()
    }

    /// `(host, device_id)` for every stop that reached the mock.
    pub async fn stopped(&self) -> Vec<(String, String)> {
        self.stopped.lock().await.clone()
    }

    async fn ensure_reachable(&self, host: &str) -> HostResult<()> {
        if self.unreachable.read().await.contains(host) {
            return Err(HostError::Unreachable {
                host: host.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DriverControl for MockDriverControl {
    async fn start_driver(
        &self,
        host: &str,
        request: &StartDriverRequest,
    ) -> HostResult<StartDriverResponse> {
        self.ensure_reachable(host).await?;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.started
            .lock()
            .await
            .push((host.to_string(), request.clone()));

        if self.reject_starts.load(Ordering::SeqCst) {
            return Err(HostError::Rejected {
                host: host.to_string(),
                status: 503,
                message: "no free ports available in range".to_string(),
            });
        }

        info!(host = %host, device_id = %request.device_id, "[MOCK] Driver started");
        Ok(StartDriverResponse {
            session_url: format!("http://{}:4723/wd/hub", host),
        })
    }

    async fn stop_driver(&self, host: &str, device_id: &str) -> HostResult<()> {
        self.ensure_reachable(host).await?;
        self.stopped
            .lock()
            .await
            .push((host.to_string(), device_id.to_string()));
        Ok(())
    }

    async fn live_bindings(&self, host: &str) -> HostResult<BindingsResponse> {
        self.ensure_reachable(host).await?;
        let bindings = self.bindings.read().await;
        let devices = bindings.get(host).cloned().unwrap_or_default();
        Ok(BindingsResponse {
            host: host.to_string(),
            bindings: devices
                .into_iter()
                .enumerate()
                .map(|(i, device_id)| LiveBinding {
                    device_id,
                    port: 4723 + i as u16,
                    state: DriverState::Ready,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HostAgentClient {
        HostAgentClient::new(server.address().port(), Duration::from_secs(5)).unwrap()
    }

    fn start_request() -> StartDriverRequest {
        StartDriverRequest {
            device_id: "R5CR".to_string(),
            is_android: true,
            request_id: "req-1".to_string(),
            browser_version: None,
        }
    }

    #[tokio::test]
    async fn test_start_driver_returns_session_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/driver/start"))
            .and(body_json(start_request()))
            .respond_with(ResponseTemplate::new(200).set_body_json(StartDriverResponse {
                session_url: "http://127.0.0.1:4723/wd/hub".to_string(),
            }))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server)
            .start_driver("127.0.0.1", &start_request())
            .await
            .unwrap();
        assert_eq!(response.session_url, "http://127.0.0.1:4723/wd/hub");
    }

    #[tokio::test]
    async fn test_start_driver_rejection_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/driver/start"))
            .respond_with(ResponseTemplate::new(503).set_body_string("pool exhausted"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .start_driver("127.0.0.1", &start_request())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Rejected { status: 503, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_transient() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HostAgentClient::new(port, Duration::from_secs(2)).unwrap();
        let err = client.stop_driver("127.0.0.1", "R5CR").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.host(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_live_bindings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/driver/bindings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(BindingsResponse {
                host: "127.0.0.1".to_string(),
                bindings: vec![LiveBinding {
                    device_id: "R5CR".to_string(),
                    port: 4723,
                    state: DriverState::Ready,
                }],
            }))
            .mount(&server)
            .await;

        let response = client_for(&server).live_bindings("127.0.0.1").await.unwrap();
        assert_eq!(response.bindings.len(), 1);
        assert_eq!(response.bindings[0].device_id, "R5CR");
    }
}
