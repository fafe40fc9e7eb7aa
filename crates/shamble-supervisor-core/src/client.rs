use crate::config::Endpoint;
use crate::error::SupervisorError;
use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

/// An endpoint the supervisor has confirmed to be reachable.
///
/// Only `BackendSupervisor::reachable_endpoint` hands these out, so holding one
/// means a probe or readiness check succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachableEndpoint {
    endpoint: Endpoint,
}

impl ReachableEndpoint {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Builds the application's RPC client for a backend endpoint
#[async_trait]
pub trait ClientConnector: Send + Sync {
    type Client: Send;

    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Self::Client>;
}

/// A connected client bound to the supervised endpoint
#[derive(Debug)]
pub struct ClientHandle<C> {
    endpoint: Endpoint,
    client: C,
}

impl<C: Send> ClientHandle<C> {
    pub async fn connect<K>(
        connector: &K,
        reachable: &ReachableEndpoint,
    ) -> Result<Self, SupervisorError>
    where
        K: ClientConnector<Client = C>,
    {
        let endpoint = reachable.endpoint().clone();
        let client = connector
            .connect(&endpoint)
            .await
            .with_context(|| format!("Failed to connect client to {endpoint}"))?;

        info!(%endpoint, "Client connected to backend");
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoConnector {
        connects: AtomicU32,
        refuse: bool,
    }

    #[async_trait]
    impl ClientConnector for EchoConnector {
        type Client = String;

        async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                anyhow::bail!("connection refused");
            }
            Ok(format!("client@{endpoint}"))
        }
    }

    #[tokio::test]
    async fn test_connect_binds_endpoint() {
        let connector = EchoConnector {
            connects: AtomicU32::new(0),
            refuse: false,
        };
        let reachable = ReachableEndpoint::new(Endpoint::new("127.0.0.1", 33445));

        let handle = ClientHandle::connect(&connector, &reachable).await.unwrap();
        assert_eq!(handle.client(), "client@127.0.0.1:33445");
        assert_eq!(handle.endpoint(), reachable.endpoint());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let connector = EchoConnector {
            connects: AtomicU32::new(0),
            refuse: true,
        };
        let reachable = ReachableEndpoint::new(Endpoint::default());

        let error = ClientHandle::connect(&connector, &reachable)
            .await
            .unwrap_err();
        assert!(matches!(error, SupervisorError::Other(_)));
        assert!(error.to_string().contains("127.0.0.1:33445"));
    }
}
