//! Agent discovery and registry.
//!
//! The registry maps agent names to [`AgentEntry`]s built from what the
//! container runtime reports. Each refresh builds a complete new map and
//! swaps it in, so readers always see either the old or the new snapshot.
//! Entries themselves are shared between snapshots; their mutable state sits
//! behind a per-agent lock owned jointly with the lifecycle manager.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LifecycleConfig;
use crate::error::{GatewayError, Result};
use crate::obs;
use crate::runtime::{AgentEndpoint, ContainerInfo, ContainerRuntime, RuntimeError};

/// Lifecycle state of an agent container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
        }
    }

    /// Starting and Stopping are owned by the lifecycle manager.
    pub fn is_transition(self) -> bool {
        matches!(self, AgentState::Starting | AgentState::Stopping)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the runtime answered the most recent discovery poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryHealth {
    Ok,
    /// Runtime unreachable; the last known snapshot is being served.
    AdapterUnavailable,
}

/// Point-in-time view of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub container_id: String,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub endpoint: String,
    pub enabled: bool,
    pub state: AgentState,
    pub last_activity: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

/// Mutable per-agent status, guarded by [`AgentEntry::status`].
#[derive(Debug)]
pub(crate) struct AgentStatus {
    pub state: AgentState,
    /// Monotonic time of the last activity, for idle arithmetic.
    pub last_activity: Option<Instant>,
    /// Wall-clock time of the same event, for display.
    pub last_activity_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

impl AgentStatus {
    pub fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
        self.last_activity_at = Some(Utc::now());
    }
}

/// Outcome of a start attempt, shared by every caller waiting on it.
pub(crate) type SharedStart = Shared<BoxFuture<'static, std::result::Result<(), GatewayError>>>;

/// One discovered agent.
pub struct AgentEntry {
    name: String,
    facts: Mutex<ContainerInfo>,
    status: Mutex<AgentStatus>,
    start_slot: Mutex<Option<SharedStart>>,
}

impl std::fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEntry")
            .field("name", &self.name)
            .field("facts", &self.facts)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AgentEntry {
    fn new(info: ContainerInfo) -> Self {
        let state = if info.running {
            AgentState::Running
        } else {
            AgentState::Stopped
        };
        Self {
            name: info.agent_name.clone(),
            facts: Mutex::new(info),
            status: Mutex::new(AgentStatus {
                state,
                last_activity: None,
                last_activity_at: None,
                in_flight: 0,
            }),
            start_slot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container_id(&self) -> String {
        lock(&self.facts).container_id.clone()
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        lock(&self.facts).endpoint()
    }

    pub fn address(&self) -> Option<IpAddr> {
        lock(&self.facts).address
    }

    pub fn state(&self) -> AgentState {
        lock(&self.status).state
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        let facts = lock(&self.facts).clone();
        let status = lock(&self.status);
        AgentDescriptor {
            name: self.name.clone(),
            endpoint: facts.endpoint().to_string(),
            container_id: facts.container_id,
            address: facts.address,
            port: facts.port,
            enabled: true,
            state: status.state,
            last_activity: status.last_activity_at,
            in_flight: status.in_flight,
        }
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, AgentStatus> {
        lock(&self.status)
    }

    pub(crate) fn start_slot(&self) -> MutexGuard<'_, Option<SharedStart>> {
        lock(&self.start_slot)
    }

    pub(crate) fn set_facts(&self, info: ContainerInfo) {
        *lock(&self.facts) = info;
    }

    /// Fold a discovery observation into this entry. Transitional states are
    /// left alone; settled states follow what the runtime reports.
    fn reconcile(&self, info: ContainerInfo) {
        let running = info.running;
        self.set_facts(info);
        let mut status = self.status();
        if !status.state.is_transition() {
            status.state = if running {
                AgentState::Running
            } else {
                AgentState::Stopped
            };
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    agents: HashMap<String, Arc<AgentEntry>>,
    by_address: HashMap<IpAddr, String>,
}

/// Discovered agents, refreshed from the container runtime.
pub struct Registry {
    runtime: Arc<dyn ContainerRuntime>,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_lock: tokio::sync::Mutex<()>,
    available: AtomicBool,
    list_timeout: Duration,
}

impl Registry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_lock: tokio::sync::Mutex::new(()),
            available: AtomicBool::new(true),
            list_timeout: LifecycleConfig::default().adapter_timeout,
        }
    }

    /// Bound on a single runtime listing; a listing that overruns counts as
    /// the runtime being unreachable.
    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Poll the runtime and publish a new snapshot.
    ///
    /// On adapter failure the previous snapshot stays in place and the
    /// registry reports [`DiscoveryHealth::AdapterUnavailable`]; the
    /// transition is logged once, not on every poll.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;

        let listing = tokio::time::timeout(self.list_timeout, self.runtime.list_agents())
            .await
            .unwrap_or_else(|_| {
                Err(RuntimeError::Unreachable(format!(
                    "listing containers took longer than {}ms",
                    self.list_timeout.as_millis()
                )))
            });
        let mut found = match listing {
            Ok(found) => found,
            Err(e) => {
                if self.available.swap(false, Ordering::SeqCst) {
                    obs::emit_discovery_degraded(&e);
                }
                return Err(e.into());
            }
        };
        if !self.available.swap(true, Ordering::SeqCst) {
            obs::emit_discovery_recovered();
        }

        // Running containers win when two claim the same agent name.
        found.sort_by_key(|info| !info.running);

        let current = self.current();
        let mut next = Snapshot::default();
        for info in found {
            if next.agents.contains_key(&info.agent_name) {
                warn!(
                    agent = %info.agent_name,
                    container_id = %info.container_id,
                    "duplicate agent name, ignoring container"
                );
                continue;
            }
            let name = info.agent_name.clone();
            let entry = match current.agents.get(&name) {
                Some(existing) => {
                    existing.reconcile(info);
                    existing.clone()
                }
                None => {
                    debug!(agent = %name, "discovered agent");
                    Arc::new(AgentEntry::new(info))
                }
            };
            next.agents.insert(name, entry);
        }

        for gone in current.agents.keys().filter(|k| !next.agents.contains_key(*k)) {
            debug!(agent = %gone, "agent container disappeared");
        }

        let count = next.agents.len();
        // Addresses are read under the write lock so a concurrent
        // `index_address` is never overwritten with stale facts.
        let mut published = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        for (name, entry) in &next.agents {
            if let Some(ip) = entry.address() {
                next.by_address.insert(ip, name.clone());
            }
        }
        *published = Arc::new(next);
        Ok(count)
    }

    /// Current entry for `name`, without touching the runtime.
    pub fn lookup(&self, name: &str) -> Option<Arc<AgentEntry>> {
        self.current().agents.get(name).cloned()
    }

    /// Like [`lookup`](Self::lookup), but refreshes once on a miss.
    pub async fn resolve(&self, name: &str) -> Result<Arc<AgentEntry>> {
        if let Some(entry) = self.lookup(name) {
            return Ok(entry);
        }
        if let Err(e) = self.refresh().await {
            debug!(agent = %name, error = %e, "refresh on miss failed");
        }
        self.lookup(name).ok_or_else(|| GatewayError::AgentNotFound {
            name: name.to_string(),
        })
    }

    pub fn descriptor(&self, name: &str) -> Option<AgentDescriptor> {
        self.lookup(name).map(|e| e.descriptor())
    }

    /// All agents, sorted by name.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self
            .current()
            .agents
            .values()
            .map(|e| e.descriptor())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub(crate) fn entries(&self) -> Vec<Arc<AgentEntry>> {
        self.current().agents.values().cloned().collect()
    }

    /// Which agent owns `ip` on the agents network.
    pub fn agent_for_address(&self, ip: IpAddr) -> Option<String> {
        self.current().by_address.get(&ip).cloned()
    }

    /// Re-index the address of `name` after its container restarted.
    pub(crate) fn index_address(&self, name: &str) {
        let mut published = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let current = published.clone();
        let Some(entry) = current.agents.get(name) else {
            return;
        };
        let mut by_address: HashMap<IpAddr, String> = current
            .by_address
            .iter()
            .filter(|(_, owner)| owner.as_str() != name)
            .map(|(ip, owner)| (*ip, owner.clone()))
            .collect();
        if let Some(ip) = entry.address() {
            by_address.insert(ip, name.to_string());
        }
        *published = Arc::new(Snapshot {
            agents: current.agents.clone(),
            by_address,
        });
    }

    pub fn health(&self) -> DiscoveryHealth {
        if self.available.load(Ordering::SeqCst) {
            DiscoveryHealth::Ok
        } else {
            DiscoveryHealth::AdapterUnavailable
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }
}
