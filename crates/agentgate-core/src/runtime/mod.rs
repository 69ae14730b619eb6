//! Container runtime adapter.
//!
//! The gateway needs four capabilities from whatever runs the agent
//! containers: list, inspect, start and stop. [`ContainerRuntime`] is the
//! seam; [`docker::DockerRuntime`] talks to the Docker Engine API and
//! [`fake::FakeRuntime`] backs tests.

pub mod docker;
pub mod fake;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

/// Errors produced by a container runtime adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("container not found: {container}")]
    NotFound { container: String },

    #[error("{operation} failed for {container}: {message}")]
    Operation {
        operation: &'static str,
        container: String,
        message: String,
    },
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Where an agent listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    /// IP on the agents network, or a resolvable container name.
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("http://[{v6}]:{}", self.port),
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An opted-in agent container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub container_id: String,
    pub agent_name: String,
    /// Address on the agents network, when attached and running.
    pub address: Option<IpAddr>,
    /// Fallback host name when no address is known.
    pub host_name: String,
    pub port: u16,
    pub running: bool,
}

impl ContainerInfo {
    pub fn endpoint(&self) -> AgentEndpoint {
        match self.address {
            Some(ip) => AgentEndpoint::new(ip.to_string(), self.port),
            None => AgentEndpoint::new(self.host_name.clone(), self.port),
        }
    }
}

/// Capabilities the gateway needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers that opted in to being agents, running or not.
    async fn list_agents(&self) -> RuntimeResult<Vec<ContainerInfo>>;

    /// Current facts about one container.
    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo>;

    async fn start(&self, container_id: &str) -> RuntimeResult<()>;

    async fn stop(&self, container_id: &str) -> RuntimeResult<()>;

    /// Whether the agent's port accepts TCP connections.
    async fn accepts_connections(&self, endpoint: &AgentEndpoint) -> bool {
        let target = (endpoint.host.as_str(), endpoint.port);
        matches!(
            tokio::time::timeout(Duration::from_secs(1), tokio::net::TcpStream::connect(target))
                .await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_prefers_network_address() {
        let mut info = ContainerInfo {
            container_id: "c1".into(),
            agent_name: "hello".into(),
            address: Some("172.20.0.5".parse().unwrap()),
            host_name: "hello".into(),
            port: 8000,
            running: true,
        };
        assert_eq!(info.endpoint().base_url(), "http://172.20.0.5:8000");

        info.address = None;
        assert_eq!(info.endpoint().base_url(), "http://hello:8000");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let ep = AgentEndpoint::new("fd00::5", 9000);
        assert_eq!(ep.base_url(), "http://[fd00::5]:9000");
    }

    struct ProbeOnly;

    #[async_trait]
    impl ContainerRuntime for ProbeOnly {
        async fn list_agents(&self) -> RuntimeResult<Vec<ContainerInfo>> {
            Ok(Vec::new())
        }
        async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
            Err(RuntimeError::NotFound {
                container: container_id.to_string(),
            })
        }
        async fn start(&self, _: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> RuntimeResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_probe_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ep = AgentEndpoint::new("127.0.0.1", port);
        assert!(ProbeOnly.accepts_connections(&ep).await);

        drop(listener);
        assert!(!ProbeOnly.accepts_connections(&ep).await);
    }
}
