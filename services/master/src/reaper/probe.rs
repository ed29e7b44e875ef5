use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Decides whether a host is still there.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_reachable(&self, host: &str) -> bool;
}

/// Probes a host by opening a TCP connection to its agent port.
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl HostProbe for TcpProbe {
    async fn is_reachable(&self, host: &str) -> bool {
        match timeout(self.timeout, TcpStream::connect((host, self.port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(host = %host, port = self.port, error = %e, "host probe failed: connection error");
                false
            }
            Err(_) => {
                debug!(host = %host, port = self.port, "host probe failed: timeout");
                false
            }
        }
    }
}
