//! End-to-end gateway flows with a fake runtime and scripted agents.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentgate_core::{
    AgentClient, AgentEndpoint, AgentFilter, AgentReply, AgentState, AgentsFile, ErrorKind,
    FakeRuntime, Gateway, GatewayConfig, GatewayError, InvokeOutcome, InvokeRequest, RetryPolicy,
};
use agentgate_state::{
    connect_store, AuditRecord, AuditStore, JobId, JobRecord, JobState, JobStore, MemoryStore,
    StorageError, StorageResult, StoreMode, StoreOptions, SurrealConfig,
};
use async_trait::async_trait;
use serde_json::{json, Value};

const AGENTS: &str = r#"
[[agents]]
name = "hello"
egress_allowlist = ["api.example.com"]

[[agents]]
name = "dormant"
"#;

fn config(root: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.lifecycle.start_timeout = Duration::from_millis(300);
    config.lifecycle.start_poll_interval = Duration::from_millis(10);
    config.lifecycle.adapter_timeout = Duration::from_secs(1);
    config.invoke.artifacts_root = root.to_path_buf();
    config.invoke.sync_timeout = Duration::from_secs(2);
    config.invoke.invoke_timeout = Duration::from_secs(2);
    config.invoke.max_upload_bytes = 1024;
    config.audit_retry = RetryPolicy {
        attempt_timeout_ms: 500,
        max_retries: 1,
        backoff_base_ms: 1,
    };
    config.agents = AgentsFile::from_toml_str(AGENTS).unwrap();
    config
}

/// Agent double answering every call the same way.
struct ScriptedAgent {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl ScriptedAgent {
    fn replying(status: u16, body: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.to_vec(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            status: 200,
            body: b"{}".to_vec(),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn invoke(
        &self,
        endpoint: &AgentEndpoint,
        thread_id: &str,
        payload: &Value,
    ) -> agentgate_core::Result<AgentReply> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), thread_id.to_string(), payload.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(AgentReply {
            status: self.status,
            body: self.body.clone(),
        })
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    rt: Arc<FakeRuntime>,
    gateway: Gateway,
}

fn fixture_with(
    agent: Arc<ScriptedAgent>,
    store: Arc<dyn agentgate_state::GatewayStore>,
    mode: StoreMode,
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.add_agent("hello", false);
    let gateway = Gateway::new(config(tmp.path()), rt.clone(), store, mode, agent).unwrap();
    Fixture { _tmp: tmp, rt, gateway }
}

fn fixture(agent: Arc<ScriptedAgent>) -> Fixture {
    fixture_with(agent, Arc::new(MemoryStore::new()), StoreMode::InMemory)
}

fn finished(outcome: InvokeOutcome) -> JobRecord {
    match outcome {
        InvokeOutcome::Finished(job) => job,
        other => panic!("expected a finished job, got {other:?}"),
    }
}

#[tokio::test]
async fn stopped_agent_is_started_and_job_completes() {
    let agent = ScriptedAgent::replying(200, br#"{"greeting":"hi"}"#);
    let f = fixture(agent.clone());
    f.gateway.registry().refresh().await.unwrap();

    let req = InvokeRequest::new("hello", json!({"name": "world"})).sync(true);
    let job = finished(f.gateway.invoke(req).await.unwrap());

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({"greeting": "hi"})));
    assert_eq!(job.audit_sequence, Some(0));
    assert!(job.audit_error.is_none());
    assert_eq!(f.rt.start_calls(), 1);
    assert_eq!(
        f.gateway.registry().descriptor("hello").unwrap().state,
        AgentState::Running
    );

    let calls = agent.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, job.id.as_str());
    assert_eq!(calls[0].2, json!({"name": "world"}));

    let first = f.gateway.result(&job.id).await.unwrap();
    let second = f.gateway.result(&job.id).await.unwrap();
    assert_eq!(first.job, second.job);
    assert_eq!(first.artifacts, second.artifacts);

    assert!(f.gateway.verify_audit(0).await.unwrap().is_intact());
}

#[tokio::test]
async fn async_invoke_returns_thread_id_then_completes() {
    let f = fixture(ScriptedAgent::replying(200, br#"{"ok":true}"#));
    let outcome = f
        .gateway
        .invoke(InvokeRequest::new("hello", json!({})))
        .await
        .unwrap();
    let InvokeOutcome::Accepted { thread_id } = outcome else {
        panic!("expected an accepted invocation");
    };

    let job = f
        .gateway
        .jobs()
        .wait_for_terminal(&thread_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(f.gateway.status(&thread_id).await.unwrap().state, JobState::Completed);
    assert!(job.artifact_dir.unwrap().ends_with(thread_id.as_str()));
}

#[tokio::test]
async fn agent_error_fails_the_job_but_is_audited() {
    let f = fixture(ScriptedAgent::replying(500, b"exploded"));
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("500"));
    assert_eq!(job.audit_sequence, Some(0));
}

#[tokio::test]
async fn non_json_reply_is_wrapped() {
    let f = fixture(ScriptedAgent::replying(200, b"just text"));
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    assert_eq!(job.result, Some(json!({"raw": "just text"})));
}

#[tokio::test]
async fn start_timeout_marks_job_timed_out() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    f.rt.set_never_healthy(true);
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    assert_eq!(job.state, JobState::TimedOut);
}

#[tokio::test]
async fn unknown_agent_is_rejected_before_a_job_exists() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    let err = f
        .gateway
        .invoke(InvokeRequest::new("ghost", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AgentNotFound { .. }));
    assert!(f.gateway.jobs().list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_wait_gives_up_but_job_keeps_running() {
    let tmp = tempfile::tempdir().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.add_agent("hello", true);
    let mut cfg = config(tmp.path());
    cfg.invoke.sync_timeout = Duration::from_millis(50);
    let gateway = Gateway::new(
        cfg,
        rt,
        Arc::new(MemoryStore::new()),
        StoreMode::InMemory,
        ScriptedAgent::slow(Duration::from_millis(300)),
    )
    .unwrap();

    let outcome = gateway
        .invoke(InvokeRequest::new("hello", json!({})).sync(true))
        .await
        .unwrap();
    let InvokeOutcome::StillRunning { thread_id } = outcome else {
        panic!("expected the sync wait to time out");
    };
    let job = gateway
        .jobs()
        .wait_for_terminal(&thread_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn uploads_are_staged_and_limited() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    let req = InvokeRequest::new("hello", json!({}))
        .sync(true)
        .with_upload("../notes.txt", b"hello".to_vec());
    let job = finished(f.gateway.invoke(req).await.unwrap());
    let dir = std::path::PathBuf::from(job.artifact_dir.unwrap());
    assert_eq!(std::fs::read(dir.join("in").join("notes.txt")).unwrap(), b"hello");

    let too_big = InvokeRequest::new("hello", json!({})).with_upload("big.bin", vec![0u8; 2048]);
    let err = f.gateway.invoke(too_big).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
}

#[tokio::test]
async fn result_lists_output_artifacts() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    let out = std::path::PathBuf::from(job.artifact_dir.unwrap()).join("out");
    std::fs::write(out.join("answer.txt"), b"42").unwrap();

    let result = f.gateway.result(&job.id).await.unwrap();
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].name, "answer.txt");
}

#[tokio::test]
async fn progress_only_while_running() {
    let f = fixture(ScriptedAgent::slow(Duration::from_millis(200)));
    let InvokeOutcome::Accepted { thread_id } = f
        .gateway
        .invoke(InvokeRequest::new("hello", json!({})))
        .await
        .unwrap()
    else {
        panic!("expected an accepted invocation");
    };

    // Wait until the job is running.
    for _ in 0..100 {
        if f.gateway.status(&thread_id).await.unwrap().state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let job = f
        .gateway
        .report_progress(&thread_id, json!({"step": 1}))
        .await
        .unwrap();
    assert_eq!(job.progress, Some(json!({"step": 1})));

    f.gateway
        .jobs()
        .wait_for_terminal(&thread_id, Duration::from_secs(2))
        .await
        .unwrap();
    let err = f
        .gateway
        .report_progress(&thread_id, json!({"step": 2}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test]
async fn listing_includes_configured_agents() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    f.gateway.registry().refresh().await.unwrap();

    let all = f.gateway.list_agents(AgentFilter::All);
    let names: Vec<_> = all.iter().map(|a| (a.name.as_str(), a.state.as_str())).collect();
    assert_eq!(names, vec![("dormant", "configured"), ("hello", "stopped")]);

    assert!(f.gateway.list_agents(AgentFilter::Running).is_empty());
    assert_eq!(f.gateway.list_agents(AgentFilter::Stopped).len(), 1);
    assert!(f.gateway.agent("hello").is_ok());
    assert_eq!(f.gateway.agent("dormant").unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reload_swaps_allowlists() {
    let f = fixture(ScriptedAgent::replying(200, b"{}"));
    assert!(f.gateway.allowlist().check("hello", "api.example.com").is_ok());

    let next = AgentsFile::from_toml_str(
        r#"
        [[agents]]
        name = "hello"
        egress_allowlist = ["*.internal.example"]
        "#,
    )
    .unwrap();
    f.gateway.reload(next).unwrap();
    assert!(f.gateway.allowlist().check("hello", "api.example.com").is_err());
    assert!(f.gateway.allowlist().check("hello", "db.internal.example").is_ok());
    let names: Vec<_> = f
        .gateway
        .list_agents(AgentFilter::All)
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["hello"]);
}

#[tokio::test]
async fn durable_store_down_falls_back_and_forgets_on_restart() {
    let options = StoreOptions {
        surreal: Some(SurrealConfig::new("ws://127.0.0.1:1")),
        connect_attempts: 2,
        retry_delay: Duration::from_millis(10),
    };
    let (store, mode) = connect_store(&options).await;
    assert_eq!(mode, StoreMode::InMemoryFallback);

    let f = fixture_with(ScriptedAgent::replying(200, br#"{"greeting":"hi"}"#), store, mode);
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    assert_eq!(job.state, JobState::Completed);

    let health = f.gateway.health();
    assert_eq!(health.status, "degraded");
    assert_eq!(health.persistence, "memory_fallback");

    // A restart gets a fresh fallback store.
    let (store, mode) = connect_store(&options).await;
    let restarted = fixture_with(ScriptedAgent::replying(200, b"{}"), store, mode);
    let err = restarted.gateway.status(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Job table works, audit log is down.
#[derive(Default)]
struct AuditDown(MemoryStore);

#[async_trait]
impl JobStore for AuditDown {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        self.0.insert_job(job).await
    }
    async fn update_job(&self, job: &JobRecord) -> StorageResult<()> {
        self.0.update_job(job).await
    }
    async fn get_job(&self, id: &JobId) -> StorageResult<JobRecord> {
        self.0.get_job(id).await
    }
    async fn list_jobs(&self, agent_name: Option<&str>) -> StorageResult<Vec<JobRecord>> {
        self.0.list_jobs(agent_name).await
    }
}

#[async_trait]
impl AuditStore for AuditDown {
    async fn append_audit(&self, _record: &AuditRecord) -> StorageResult<()> {
        Err(StorageError::Backend("audit table offline".into()))
    }
    async fn last_audit(&self) -> StorageResult<Option<AuditRecord>> {
        Ok(None)
    }
    async fn get_audit(&self, _sequence: u64) -> StorageResult<Option<AuditRecord>> {
        Ok(None)
    }
    async fn audit_from(&self, _from: u64) -> StorageResult<Vec<AuditRecord>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn audit_outage_is_surfaced_on_the_job() {
    let f = fixture_with(
        ScriptedAgent::replying(200, b"{}"),
        Arc::new(AuditDown::default()),
        StoreMode::Durable,
    );
    let job = finished(
        f.gateway
            .invoke(InvokeRequest::new("hello", json!({})).sync(true))
            .await
            .unwrap(),
    );
    assert_eq!(job.state, JobState::Completed);
    assert!(job.audit_sequence.is_none());
    assert!(job.audit_error.unwrap().contains("audit table offline"));
}
