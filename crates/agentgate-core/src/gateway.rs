//! The gateway facade: everything the HTTP layer calls.
//!
//! An invocation resolves the agent, stages its artifact directories,
//! creates a job and hands the actual work to a spawned task:
//!
//! 1. `ensure_running` (lazy start, shared with concurrent callers)
//! 2. `Queued → Running`
//! 3. forward the payload to the agent
//! 4. append the audit record and attach its outcome to the job
//! 5. settle the job in its terminal state
//!
//! Synchronous callers wait on the job engine for step 5.

use std::sync::{Arc, RwLock};

use agentgate_state::{ContentDigest, GatewayStore, JobId, JobRecord, JobState, StoreMode};
use serde::Serialize;
use serde_json::Value;
use tracing::{warn, Instrument};

use crate::agent_client::AgentClient;
use crate::artifacts::{ArtifactEntry, ArtifactStore};
use crate::audit::{AuditChain, ChainReport};
use crate::config::{AgentsFile, GatewayConfig};
use crate::egress::{AllowlistTable, EgressPolicy};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::jobs::JobEngine;
use crate::lifecycle::{IdlePolicy, LifecycleManager};
use crate::metrics::{MetricsSnapshot, METRICS};
use crate::obs;
use crate::registry::{AgentDescriptor, AgentState, DiscoveryHealth, Registry};
use crate::runtime::ContainerRuntime;

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub agent: String,
    pub payload: Value,
    pub sync: bool,
    pub uploads: Vec<Upload>,
}

impl InvokeRequest {
    pub fn new(agent: impl Into<String>, payload: Value) -> Self {
        Self {
            agent: agent.into(),
            payload,
            sync: false,
            uploads: Vec::new(),
        }
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_upload(mut self, filename: impl Into<String>, data: Vec<u8>) -> Self {
        self.uploads.push(Upload {
            filename: filename.into(),
            data,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    /// Async invocation accepted.
    Accepted { thread_id: JobId },
    /// Sync invocation reached a terminal state.
    Finished(JobRecord),
    /// Sync invocation still running when the wait ran out.
    StillRunning { thread_id: JobId },
}

/// Result view of a job plus the files it produced.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: JobRecord,
    pub artifacts: Vec<ArtifactEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFilter {
    Running,
    Stopped,
    All,
}

impl AgentFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AgentFilter::Running),
            "stopped" => Some(AgentFilter::Stopped),
            "all" => Some(AgentFilter::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub name: String,
    /// Lifecycle state, or `configured` for agents without a container.
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub discovery: DiscoveryHealth,
    pub persistence: &'static str,
    pub agents: usize,
    pub metrics: MetricsSnapshot,
}

/// How a job ended, before it is written back.
enum Settlement {
    Completed { result: Value, response: Vec<u8> },
    Failed(String),
    TimedOut(String),
}

struct Inner {
    config: GatewayConfig,
    registry: Arc<Registry>,
    lifecycle: LifecycleManager,
    jobs: JobEngine,
    audit: AuditChain,
    artifacts: ArtifactStore,
    client: Arc<dyn AgentClient>,
    allowlist: Arc<AllowlistTable>,
    agents: RwLock<Arc<AgentsFile>>,
    store_mode: StoreMode,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn GatewayStore>,
        store_mode: StoreMode,
        client: Arc<dyn AgentClient>,
    ) -> Result<Self> {
        let registry = Arc::new(
            Registry::new(runtime).with_adapter_timeout(config.lifecycle.adapter_timeout),
        );
        let idle = IdlePolicy::from_agents(config.lifecycle.default_idle_timeout, &config.agents);
        let lifecycle = LifecycleManager::new(registry.clone(), config.lifecycle.clone(), idle);
        let allowlist = Arc::new(AllowlistTable::new(EgressPolicy::from_agents_file(
            &config.agents,
        )?));
        let artifacts = ArtifactStore::new(
            config.invoke.artifacts_root.clone(),
            config.invoke.max_upload_bytes,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                lifecycle,
                jobs: JobEngine::new(store.clone()),
                audit: AuditChain::new(store, config.audit_retry.clone()),
                artifacts,
                client,
                allowlist,
                agents: RwLock::new(Arc::new(config.agents.clone())),
                store_mode,
                config,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn jobs(&self) -> &JobEngine {
        &self.inner.jobs
    }

    pub fn allowlist(&self) -> &Arc<AllowlistTable> {
        &self.inner.allowlist
    }

    pub fn store_mode(&self) -> StoreMode {
        self.inner.store_mode
    }

    fn agents_file(&self) -> Arc<AgentsFile> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Accept an invocation.
    ///
    /// Unknown agents and oversized uploads are rejected before a job
    /// exists. Everything after job creation happens in a background task,
    /// so a sync caller that gives up never cancels the agent call.
    pub async fn invoke(&self, req: InvokeRequest) -> Result<InvokeOutcome> {
        let inner = &self.inner;
        inner.registry.resolve(&req.agent).await?;

        let total: u64 = req.uploads.iter().map(|u| u.data.len() as u64).sum();
        inner.artifacts.check_size(total)?;
        METRICS.inc_invocations();

        let id = JobId::new();
        let dirs = inner.artifacts.prepare(&id).await?;
        for upload in &req.uploads {
            inner
                .artifacts
                .write_input(&dirs, &upload.filename, &upload.data)
                .await?;
        }
        inner
            .jobs
            .create_with_id(id.clone(), &req.agent, Some(dirs.root.display().to_string()))
            .await?;

        let gateway = self.clone();
        let span = obs::job_span(id.as_str(), &req.agent);
        let (job_id, agent, payload) = (id.clone(), req.agent.clone(), req.payload);
        tokio::spawn(
            async move { gateway.run_job(job_id, agent, payload).await }.instrument(span),
        );

        if !req.sync {
            return Ok(InvokeOutcome::Accepted { thread_id: id });
        }
        match inner
            .jobs
            .wait_for_terminal(&id, inner.config.invoke.sync_timeout)
            .await
        {
            Ok(job) => Ok(InvokeOutcome::Finished(job)),
            Err(e) if e.kind() == ErrorKind::Timeout => {
                Ok(InvokeOutcome::StillRunning { thread_id: id })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_job(&self, id: JobId, agent: String, payload: Value) {
        if let Err(e) = self.drive(&id, &agent, &payload).await {
            warn!(error = %e, "job could not be driven to completion");
        }
    }

    async fn drive(&self, id: &JobId, agent: &str, payload: &Value) -> Result<()> {
        let inner = &self.inner;
        let request_bytes = serde_json::to_vec(payload).unwrap_or_default();
        let request_digest = ContentDigest::from_bytes(&request_bytes);

        let settlement = match inner.lifecycle.ensure_running(agent).await {
            Ok(mut guard) => {
                inner.jobs.mark_running(id).await?;
                let endpoint = guard.endpoint();
                let call = inner.client.invoke(&endpoint, id.as_str(), payload);
                let timeout = inner.config.invoke.invoke_timeout;
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(reply)) => {
                        guard.mark_success();
                        if reply.is_success() {
                            let response = reply.body.clone();
                            Settlement::Completed {
                                result: reply.into_result(),
                                response,
                            }
                        } else {
                            Settlement::Failed(reply.failure_message())
                        }
                    }
                    Ok(Err(e)) if e.kind() == ErrorKind::Timeout => {
                        Settlement::TimedOut(e.to_string())
                    }
                    Ok(Err(e)) => Settlement::Failed(e.to_string()),
                    Err(_) => Settlement::TimedOut(
                        GatewayError::timeout(format!("invoke {agent}"), timeout).to_string(),
                    ),
                }
            }
            Err(e) => {
                // Never reached the agent; the job still has to end.
                inner.jobs.mark_running(id).await?;
                if e.kind() == ErrorKind::Timeout {
                    Settlement::TimedOut(e.to_string())
                } else {
                    Settlement::Failed(e.to_string())
                }
            }
        };

        let response_digest = match &settlement {
            Settlement::Completed { response, .. } => ContentDigest::from_bytes(response),
            Settlement::Failed(msg) | Settlement::TimedOut(msg) => {
                ContentDigest::from_bytes(msg.as_bytes())
            }
        };
        let audit_outcome = match inner
            .audit
            .append(id, agent, request_digest, response_digest)
            .await
        {
            Ok(record) => Ok(record.sequence),
            Err(e) => Err(e.to_string()),
        };
        inner.jobs.record_audit(id, audit_outcome).await?;

        match settlement {
            Settlement::Completed { result, .. } => inner.jobs.mark_completed(id, result).await?,
            Settlement::Failed(msg) => inner.jobs.mark_failed(id, msg).await?,
            Settlement::TimedOut(msg) => inner.jobs.mark_timed_out(id, msg).await?,
        };
        Ok(())
    }

    pub async fn status(&self, id: &JobId) -> Result<JobRecord> {
        self.inner.jobs.get(id).await
    }

    /// The job together with its output artifacts; artifacts are only
    /// listed once the job completed.
    pub async fn result(&self, id: &JobId) -> Result<JobResult> {
        let job = self.inner.jobs.get(id).await?;
        let artifacts = if job.state == JobState::Completed {
            self.inner.artifacts.list_outputs(id).await?
        } else {
            Vec::new()
        };
        Ok(JobResult { job, artifacts })
    }

    /// Progress reported by the agent working on `id`.
    pub async fn report_progress(&self, id: &JobId, progress: Value) -> Result<JobRecord> {
        let job = self.inner.jobs.update_progress(id, progress).await?;
        self.inner.lifecycle.record_activity(&job.agent_name);
        Ok(job)
    }

    pub fn list_agents(&self, filter: AgentFilter) -> Vec<AgentSummary> {
        let discovered = self.inner.registry.list();
        let mut out: Vec<AgentSummary> = discovered
            .iter()
            .filter(|d| match filter {
                AgentFilter::Running => d.state == AgentState::Running,
                AgentFilter::Stopped => d.state == AgentState::Stopped,
                AgentFilter::All => true,
            })
            .map(|d| AgentSummary {
                name: d.name.clone(),
                state: d.state.as_str().to_string(),
            })
            .collect();

        if filter == AgentFilter::All {
            let agents = self.agents_file();
            for name in agents.names() {
                if !discovered.iter().any(|d| d.name == name) {
                    out.push(AgentSummary {
                        name: name.to_string(),
                        state: "configured".into(),
                    });
                }
            }
            out.sort_by(|a, b| a.name.cmp(&b.name));
        }
        out
    }

    pub fn agent(&self, name: &str) -> Result<AgentDescriptor> {
        self.inner
            .registry
            .descriptor(name)
            .ok_or_else(|| GatewayError::AgentNotFound {
                name: name.to_string(),
            })
    }

    pub fn health(&self) -> HealthReport {
        let discovery = self.inner.registry.health();
        let degraded = discovery != DiscoveryHealth::Ok
            || self.inner.store_mode == StoreMode::InMemoryFallback;
        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            discovery,
            persistence: self.inner.store_mode.as_str(),
            agents: self.inner.registry.list().len(),
            metrics: METRICS.snapshot(),
        }
    }

    pub async fn verify_audit(&self, from: u64) -> Result<ChainReport> {
        self.inner.audit.verify(from).await
    }

    /// Apply a new agents file. On error nothing changes.
    pub fn reload(&self, agents: AgentsFile) -> Result<()> {
        let policy = EgressPolicy::from_agents_file(&agents)?;
        let idle = IdlePolicy::from_agents(
            self.inner.config.lifecycle.default_idle_timeout,
            &agents,
        );
        self.inner.allowlist.replace(policy);
        self.inner.lifecycle.set_idle_policy(idle);
        *self.inner.agents.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(agents);
        tracing::info!("agent configuration reloaded");
        Ok(())
    }
}
