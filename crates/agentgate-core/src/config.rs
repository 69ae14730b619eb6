//! Gateway configuration.
//!
//! Tunables live in [`GatewayConfig`], whose `Default` matches production
//! defaults; the daemon overlays CLI flags and environment variables on top.
//! Per-agent policy (egress allowlist, idle timeout) comes from a TOML agents
//! file that can be reloaded at runtime.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::retry::RetryPolicy;

/// How containers are recognised and addressed.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Label that must equal `"true"` for a container to be considered.
    pub enabled_label: String,
    /// Label carrying the agent name; the container name is used without it.
    pub name_label: String,
    /// Label carrying the agent's listening port.
    pub port_label: String,
    pub default_port: u16,
    /// Network whose address is used to reach agents and identify egress.
    pub network: String,
    pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled_label: "agent.enabled".to_string(),
            name_label: "com.docker.compose.service".to_string(),
            port_label: "agent.port".to_string(),
            default_port: 8000,
            network: "agents-int".to_string(),
            refresh_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Idle timeout for agents without an override in the agents file.
    pub default_idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a lazy start may take before callers get a timeout.
    pub start_timeout: Duration,
    pub start_poll_interval: Duration,
    /// Upper bound on any single container runtime call.
    pub adapter_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            start_timeout: Duration::from_secs(30),
            start_poll_interval: Duration::from_millis(500),
            adapter_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeConfig {
    /// Upper bound on a single forwarded agent call.
    pub invoke_timeout: Duration,
    /// How long a synchronous invoke waits for a terminal state.
    pub sync_timeout: Duration,
    pub artifacts_root: PathBuf,
    pub max_upload_bytes: u64,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(300),
            sync_timeout: Duration::from_secs(300),
            artifacts_root: PathBuf::from("/artifacts"),
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Forward absolute-form `http://` requests instead of answering 405.
    pub allow_plain_http: bool,
    /// Accept `X-Agent-Name` when the source address is unmapped.
    pub trust_agent_header: bool,
    pub connect_timeout: Duration,
    pub max_header_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3128)),
            allow_plain_http: false,
            trust_agent_header: false,
            connect_timeout: Duration::from_secs(10),
            max_header_bytes: 16 * 1024,
        }
    }
}

/// Everything the gateway core needs to run.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub discovery: DiscoveryConfig,
    pub lifecycle: LifecycleConfig,
    pub invoke: InvokeConfig,
    pub proxy: ProxyConfig,
    pub audit_retry: RetryPolicy,
    pub agents: AgentsFile,
}

/// Per-agent policy as written in the agents file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub name: String,
    /// Host patterns: `api.example.com` or `*.example.com`.
    #[serde(default)]
    pub egress_allowlist: Vec<String>,
    /// Idle timeout in minutes; falls back to the global default.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
}

impl AgentPolicy {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }
}

/// Contents of the agents file.
///
/// ```toml
/// [[agents]]
/// name = "hello"
/// egress_allowlist = ["api.example.com"]
/// idle_timeout = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentPolicy>,
}

impl AgentsFile {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: AgentsFile =
            toml::from_str(raw).map_err(|e| GatewayError::Config(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` if given, otherwise an empty file.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentPolicy> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.name.as_str())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(GatewayError::Config("agent with empty name".into()));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "agent {} listed twice",
                    agent.name
                )));
            }
        }
        Ok(())
    }
}
