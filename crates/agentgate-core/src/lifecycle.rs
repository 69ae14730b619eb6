//! Agent lifecycle: lazy start, activity tracking and idle stop.
//!
//! Per agent: `Stopped → Starting → Running → Stopping → Stopped`.
//!
//! At most one start runs per agent. The start is a spawned task whose
//! outcome is shared by every caller that asked for the agent while it was
//! in flight, so a burst of requests against a stopped agent issues a single
//! runtime start. Requests hold an [`ActivityGuard`] while they use the
//! agent; the idle sweep never stops an agent with a live guard.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{AgentsFile, LifecycleConfig};
use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::{AgentEntry, AgentState, Registry, SharedStart};
use crate::runtime::AgentEndpoint;

/// Idle timeouts: a global default plus per-agent overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct IdlePolicy {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl IdlePolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn from_agents(default: Duration, agents: &AgentsFile) -> Self {
        let overrides = agents
            .agents
            .iter()
            .filter_map(|a| a.idle_timeout().map(|t| (a.name.clone(), t)))
            .collect();
        Self { default, overrides }
    }

    pub fn with_override(mut self, agent: impl Into<String>, timeout: Duration) -> Self {
        self.overrides.insert(agent.into(), timeout);
        self
    }

    pub fn timeout_for(&self, agent: &str) -> Duration {
        self.overrides.get(agent).copied().unwrap_or(self.default)
    }
}

/// Proof that a request is using a running agent.
///
/// Dropping the guard releases the in-flight slot; when the request was
/// marked successful the agent's activity clock is reset as well.
#[derive(Debug)]
pub struct ActivityGuard {
    entry: Arc<AgentEntry>,
    succeeded: bool,
}

impl ActivityGuard {
    pub fn agent(&self) -> &str {
        self.entry.name()
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        self.entry.endpoint()
    }

    /// Count this request as activity when the guard is released.
    pub fn mark_success(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut status = self.entry.status();
        status.in_flight = status.in_flight.saturating_sub(1);
        if self.succeeded {
            status.touch();
        }
    }
}

struct Inner {
    registry: Arc<Registry>,
    config: LifecycleConfig,
    idle: RwLock<Arc<IdlePolicy>>,
}

/// Starts agents on demand and stops them when idle.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<Registry>, config: LifecycleConfig, idle: IdlePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                idle: RwLock::new(Arc::new(idle)),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn idle_policy(&self) -> Arc<IdlePolicy> {
        self.inner
            .idle
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap the idle-timeout table (configuration reload).
    pub fn set_idle_policy(&self, policy: IdlePolicy) {
        *self.inner.idle.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    /// Make sure `name` is running and admit one request against it.
    ///
    /// Returns `AgentNotFound` for unknown agents, `Timeout` when the agent
    /// did not become reachable within the start timeout and
    /// `AgentUnavailable` when the runtime refused to start it.
    pub async fn ensure_running(&self, name: &str) -> Result<ActivityGuard> {
        let entry = self.inner.registry.resolve(name).await?;

        // A freshly started agent can in principle be stopped again before
        // this caller is admitted; give it a couple of chances.
        for _ in 0..3 {
            if let Some(guard) = Self::admit(&entry) {
                return Ok(guard);
            }
            self.shared_start(&entry).await?;
        }

        Err(GatewayError::AgentUnavailable {
            name: name.to_string(),
            reason: "agent stopped before the request was admitted".into(),
        })
    }

    fn admit(entry: &Arc<AgentEntry>) -> Option<ActivityGuard> {
        let mut status = entry.status();
        if status.state != AgentState::Running {
            return None;
        }
        status.in_flight += 1;
        Some(ActivityGuard {
            entry: entry.clone(),
            succeeded: false,
        })
    }

    /// Join the start already in flight for this agent, or launch one.
    fn shared_start(&self, entry: &Arc<AgentEntry>) -> SharedStart {
        let mut slot = entry.start_slot();
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }

        let inner = self.inner.clone();
        let task_entry = entry.clone();
        let name = entry.name().to_string();
        let handle = tokio::spawn(async move {
            let outcome = inner.start_agent(&task_entry).await;
            task_entry.start_slot().take();
            outcome
        });

        let shared = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join) => Err(GatewayError::AgentUnavailable {
                    name,
                    reason: format!("start task aborted: {join}"),
                }),
            }
        }
        .boxed()
        .shared();

        *slot = Some(shared.clone());
        shared
    }

    /// Reset the idle clock of `name`.
    pub fn record_activity(&self, name: &str) {
        if let Some(entry) = self.inner.registry.lookup(name) {
            entry.status().touch();
        }
    }

    /// Stop every running agent that has been idle past its timeout.
    /// Returns the names of the agents that were stopped.
    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    /// [`sweep`](Self::sweep) with an explicit notion of "now".
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let idle = self.idle_policy();
        let runtime = self.inner.registry.runtime().clone();
        let mut stopped = Vec::new();

        for entry in self.inner.registry.entries() {
            let name = entry.name().to_string();
            let idle_for = {
                let mut status = entry.status();
                if status.state != AgentState::Running || status.in_flight > 0 {
                    continue;
                }
                // Agents nobody has used are left alone.
                let Some(last) = status.last_activity else {
                    continue;
                };
                let idle_for = now.saturating_duration_since(last);
                if idle_for < idle.timeout_for(&name) {
                    continue;
                }
                status.state = AgentState::Stopping;
                idle_for
            };

            debug!(agent = %name, idle_secs = idle_for.as_secs(), "stopping idle agent");
            let container = entry.container_id();
            let outcome =
                tokio::time::timeout(self.inner.config.adapter_timeout, runtime.stop(&container))
                    .await;

            let mut status = entry.status();
            match outcome {
                Ok(Ok(())) => {
                    status.state = AgentState::Stopped;
                    drop(status);
                    METRICS.inc_agents_stopped();
                    obs::emit_agent_stopped(&name, idle_for.as_secs());
                    stopped.push(name);
                }
                Ok(Err(e)) => {
                    status.state = AgentState::Running;
                    drop(status);
                    obs::emit_agent_stop_failed(&name, &e);
                }
                Err(_) => {
                    status.state = AgentState::Running;
                    drop(status);
                    let after = self.inner.config.adapter_timeout;
                    let err = GatewayError::timeout("stop_container", after);
                    obs::emit_agent_stop_failed(&name, &err);
                }
            }
        }

        stopped
    }
}

impl Inner {
    async fn start_agent(&self, entry: &AgentEntry) -> Result<()> {
        let name = entry.name();
        let started = Instant::now();
        let deadline = started + self.config.start_timeout;

        // Claim the transition, waiting out a stop that is still in flight.
        loop {
            {
                let mut status = entry.status();
                match status.state {
                    AgentState::Running => return Ok(()),
                    AgentState::Stopped | AgentState::Starting => {
                        status.state = AgentState::Starting;
                        break;
                    }
                    AgentState::Stopping => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::timeout(
                    format!("start of {name}"),
                    self.config.start_timeout,
                ));
            }
            tokio::time::sleep(self.config.start_poll_interval).await;
        }

        obs::emit_agent_starting(name);
        match self.bring_up(entry, deadline).await {
            Ok(()) => {
                {
                    let mut status = entry.status();
                    status.state = AgentState::Running;
                    status.touch();
                }
                self.registry.index_address(name);
                METRICS.inc_agents_started();
                obs::emit_agent_started(name, started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) => {
                entry.status().state = AgentState::Stopped;
                obs::emit_agent_start_failed(name, &e);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, entry: &AgentEntry, deadline: Instant) -> Result<()> {
        let name = entry.name();
        let runtime = self.registry.runtime();
        let container = entry.container_id();
        let call_timeout = self.config.adapter_timeout;

        match tokio::time::timeout(call_timeout, runtime.start(&container)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(GatewayError::AgentUnavailable {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(GatewayError::timeout("start_container", call_timeout)),
        }

        // The container may come back with a new address; keep re-reading it
        // until its port answers.
        loop {
            let inspected = tokio::time::timeout(call_timeout, runtime.inspect(&container)).await;
            if let Ok(Ok(info)) = inspected {
                entry.set_facts(info);
            }
            let endpoint = entry.endpoint();
            let probe = runtime.accepts_connections(&endpoint);
            if let Ok(true) = tokio::time::timeout_at(deadline, probe).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::timeout(
                    format!("start of {name}"),
                    self.config.start_timeout,
                ));
            }
            tokio::time::sleep(self.config.start_poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_policy_overrides_fall_back_to_default() {
        let agents = AgentsFile::from_toml_str(
            r#"
            [[agents]]
            name = "fast"
            idle_timeout = 1
            [[agents]]
            name = "plain"
            "#,
        )
        .unwrap();
        let policy = IdlePolicy::from_agents(Duration::from_secs(900), &agents);
        assert_eq!(policy.timeout_for("fast"), Duration::from_secs(60));
        assert_eq!(policy.timeout_for("plain"), Duration::from_secs(900));
        assert_eq!(policy.timeout_for("unknown"), Duration::from_secs(900));
    }
}
