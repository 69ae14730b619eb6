//! Docker Engine adapter (bollard).

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::EndpointSettings;
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use tracing::debug;

use super::{ContainerInfo, ContainerRuntime, RuntimeError, RuntimeResult};
use crate::config::DiscoveryConfig;

/// Grace period handed to `docker stop` before the container is killed.
const STOP_GRACE_SECS: i32 = 10;

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    discovery: DiscoveryConfig,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect_local(discovery: DiscoveryConfig) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        Ok(Self { docker, discovery })
    }

    pub fn with_client(docker: Docker, discovery: DiscoveryConfig) -> Self {
        Self { docker, discovery }
    }

    fn operation_error(
        operation: &'static str,
        container: &str,
        err: BollardError,
    ) -> RuntimeError {
        match &err {
            BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404 => {
                RuntimeError::NotFound {
                    container: container.to_string(),
                }
            }
            BollardError::DockerResponseServerError { .. } => RuntimeError::Operation {
                operation,
                container: container.to_string(),
                message: err.to_string(),
            },
            _ => RuntimeError::Unreachable(err.to_string()),
        }
    }
}

/// Docker answers 304 when the container is already in the requested state.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 304
    )
}

/// Turn raw container facts into agent facts, or `None` when the container
/// did not opt in.
pub(crate) fn describe_container(
    discovery: &DiscoveryConfig,
    container_id: &str,
    container_name: Option<&str>,
    labels: &HashMap<String, String>,
    running: bool,
    networks: Option<&HashMap<String, EndpointSettings>>,
) -> Option<ContainerInfo> {
    let enabled = labels
        .get(&discovery.enabled_label)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if !enabled {
        return None;
    }

    let container_name = container_name
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty());
    let agent_name = labels
        .get(&discovery.name_label)
        .cloned()
        .or_else(|| container_name.clone())?;

    let port = labels
        .get(&discovery.port_label)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(discovery.default_port);

    let address = networks
        .and_then(|nets| nets.get(&discovery.network))
        .and_then(|ep| ep.ip_address.as_deref())
        .filter(|ip| !ip.is_empty())
        .and_then(|ip| ip.parse::<IpAddr>().ok());

    Some(ContainerInfo {
        container_id: container_id.to_string(),
        host_name: container_name.unwrap_or_else(|| agent_name.clone()),
        agent_name,
        address,
        port,
        running,
    })
}

/// Daemon-side filter selecting opted-in containers.
fn label_filter(discovery: &DiscoveryConfig) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("{}=true", discovery.enabled_label)],
    )])
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_agents(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let filters = label_filter(&self.discovery);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;

        let empty = HashMap::new();
        let agents: Vec<ContainerInfo> = summaries
            .iter()
            .filter_map(|s| {
                let id = s.id.as_deref()?;
                let name = s.names.as_ref().and_then(|n| n.first()).map(String::as_str);
                let running = s
                    .state
                    .as_ref()
                    .map(ToString::to_string)
                    .is_some_and(|st| st.eq_ignore_ascii_case("running"));
                let networks = s
                    .network_settings
                    .as_ref()
                    .and_then(|ns| ns.networks.as_ref());
                describe_container(
                    &self.discovery,
                    id,
                    name,
                    s.labels.as_ref().unwrap_or(&empty),
                    running,
                    networks,
                )
            })
            .collect();

        debug!(total = summaries.len(), agents = agents.len(), "listed containers");
        Ok(agents)
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
        let detail = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::operation_error("inspect_container", container_id, e))?;

        let empty = HashMap::new();
        let labels = detail
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .unwrap_or(&empty);
        let running = detail
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let networks = detail
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref());

        describe_container(
            &self.discovery,
            detail.id.as_deref().unwrap_or(container_id),
            detail.name.as_deref(),
            labels,
            running,
            networks,
        )
        .ok_or_else(|| RuntimeError::NotFound {
            container: container_id.to_string(),
        })
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(Self::operation_error("start_container", container_id, e)),
        }
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        let options = StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(Self::operation_error("stop_container", container_id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn network(ip: &str) -> HashMap<String, EndpointSettings> {
        let mut nets = HashMap::new();
        nets.insert(
            "agents-int".to_string(),
            EndpointSettings {
                ip_address: Some(ip.to_string()),
                ..Default::default()
            },
        );
        nets
    }

    #[test]
    fn listing_asks_the_daemon_for_opted_in_containers() {
        let mut cfg = DiscoveryConfig::default();
        assert_eq!(
            label_filter(&cfg).get("label"),
            Some(&vec!["agent.enabled=true".to_string()])
        );
        cfg.enabled_label = "gateway.agent".into();
        assert_eq!(label_filter(&cfg)["label"], vec!["gateway.agent=true"]);
    }

    #[test]
    fn containers_without_opt_in_are_ignored() {
        let cfg = DiscoveryConfig::default();
        let l = labels(&[("com.docker.compose.service", "db")]);
        assert!(describe_container(&cfg, "c1", Some("/db"), &l, true, None).is_none());

        let l = labels(&[("agent.enabled", "false")]);
        assert!(describe_container(&cfg, "c1", Some("/x"), &l, true, None).is_none());
    }

    #[test]
    fn compose_service_label_names_the_agent() {
        let cfg = DiscoveryConfig::default();
        let l = labels(&[
            ("agent.enabled", "true"),
            ("com.docker.compose.service", "hello"),
            ("agent.port", "9001"),
        ]);
        let nets = network("172.20.0.7");
        let info =
            describe_container(&cfg, "abc", Some("/proj-hello-1"), &l, true, Some(&nets)).unwrap();

        assert_eq!(info.agent_name, "hello");
        assert_eq!(info.host_name, "proj-hello-1");
        assert_eq!(info.port, 9001);
        assert_eq!(info.address, Some("172.20.0.7".parse().unwrap()));
        assert!(info.running);
    }

    #[test]
    fn falls_back_to_container_name_and_default_port() {
        let cfg = DiscoveryConfig::default();
        let l = labels(&[("agent.enabled", "TRUE"), ("agent.port", "not-a-port")]);
        let info = describe_container(&cfg, "abc", Some("/echo"), &l, false, None).unwrap();

        assert_eq!(info.agent_name, "echo");
        assert_eq!(info.port, 8000);
        assert_eq!(info.address, None);
        assert_eq!(info.endpoint().to_string(), "echo:8000");
    }

    #[test]
    fn stopped_container_with_blank_ip_has_no_address() {
        let cfg = DiscoveryConfig::default();
        let l = labels(&[("agent.enabled", "true")]);
        let nets = network("");
        let info = describe_container(&cfg, "abc", Some("/echo"), &l, false, Some(&nets)).unwrap();
        assert_eq!(info.address, None);
    }
}
