//! In-memory container runtime (testing only)
//!
//! `FakeRuntime` keeps a table of agent containers and counts every start
//! and stop so tests can assert on lifecycle behaviour without Docker.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentEndpoint, ContainerInfo, ContainerRuntime, RuntimeError, RuntimeResult};

/// Scriptable [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    unavailable: AtomicBool,
    start_fails: AtomicBool,
    stop_fails: AtomicBool,
    never_healthy: AtomicBool,
    list_stalled: AtomicBool,
    start_delay: Mutex<Duration>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, ContainerInfo>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an agent container and return its id (`ctr-<name>`).
    pub fn add_agent(&self, name: &str, running: bool) -> String {
        let id = format!("ctr-{name}");
        self.insert(ContainerInfo {
            container_id: id.clone(),
            agent_name: name.to_string(),
            address: None,
            host_name: name.to_string(),
            port: 8000,
            running,
        });
        id
    }

    /// Register a fully specified container.
    pub fn insert(&self, info: ContainerInfo) {
        self.table().insert(info.container_id.clone(), info);
    }

    pub fn remove(&self, container_id: &str) {
        self.table().remove(container_id);
    }

    /// Point an agent at a concrete address and port (e.g. a local test server).
    pub fn set_endpoint(&self, container_id: &str, address: IpAddr, port: u16) {
        if let Some(c) = self.table().get_mut(container_id) {
            c.address = Some(address);
            c.port = port;
        }
    }

    pub fn set_running(&self, container_id: &str, running: bool) {
        if let Some(c) = self.table().get_mut(container_id) {
            c.running = running;
        }
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.table().get(container_id).is_some_and(|c| c.running)
    }

    /// Make every call fail as if the daemon were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn set_start_fails(&self, fails: bool) {
        self.start_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_stop_fails(&self, fails: bool) {
        self.stop_fails.store(fails, Ordering::SeqCst);
    }

    /// Started containers never accept connections.
    pub fn set_never_healthy(&self, never: bool) {
        self.never_healthy.store(never, Ordering::SeqCst);
    }

    /// Make `list_agents` hang forever, like a wedged daemon.
    pub fn set_list_stalled(&self, stalled: bool) {
        self.list_stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unreachable("fake daemon is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_agents(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        if self.list_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_available()?;
        Ok(self.table().values().cloned().collect())
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
        self.check_available()?;
        self.table()
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                container: container_id.to_string(),
            })
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_available()?;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Operation {
                operation: "start_container",
                container: container_id.to_string(),
                message: "scripted failure".into(),
            });
        }
        match self.table().get_mut(container_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                container: container_id.to_string(),
            }),
        }
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_available()?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.stop_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Operation {
                operation: "stop_container",
                container: container_id.to_string(),
                message: "scripted failure".into(),
            });
        }
        match self.table().get_mut(container_id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                container: container_id.to_string(),
            }),
        }
    }

    async fn accepts_connections(&self, endpoint: &AgentEndpoint) -> bool {
        if self.never_healthy.load(Ordering::SeqCst) {
            return false;
        }
        self.table().values().any(|c| c.running && c.endpoint() == *endpoint)
    }
}
