use crate::config::Endpoint;
use crate::error::ProbeError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

/// Answers "is something listening at this endpoint right now?"
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// `Ok(false)` for refused, timed out or otherwise failed connects.
    /// `Err` only when the address itself is unusable.
    async fn is_reachable(&self, endpoint: &Endpoint) -> Result<bool, ProbeError>;
}

/// Plain TCP connect probe
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_reachable(&self, endpoint: &Endpoint) -> Result<bool, ProbeError> {
        if endpoint.port == 0 {
            return Err(ProbeError::InvalidAddress {
                endpoint: endpoint.to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }

        if endpoint.host.trim().is_empty() {
            return Err(ProbeError::InvalidAddress {
                endpoint: endpoint.to_string(),
                reason: "host must not be empty".to_string(),
            });
        }

        let addrs: Vec<_> = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| ProbeError::Resolve {
                endpoint: endpoint.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ProbeError::InvalidAddress {
                endpoint: endpoint.to_string(),
                reason: "host resolved to no addresses".to_string(),
            });
        }

        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(%endpoint, %addr, "Endpoint accepted connection");
                    return Ok(true);
                }
                Ok(Err(e)) => debug!(%endpoint, %addr, error = %e, "Endpoint refused connection"),
                Err(_) => debug!(%endpoint, %addr, "Endpoint connect timed out"),
            }
        }

        Ok(false)
    }
}
