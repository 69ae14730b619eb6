//! Job engine: the invocation state machine.
//!
//! `Queued → Running → {Completed | Failed | TimedOut}`. Every transition of
//! one job runs under that job's async lock, so concurrent updates of the
//! same job are linearized while different jobs proceed independently.
//!
//! Terminal states are final. Repeating the exact terminal call that got
//! the job there (same state, byte-identical serialized payload) is a no-op;
//! anything else is rejected with `Conflict`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentgate_state::{GatewayStore, JobId, JobRecord, JobState};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Default)]
struct JobSlot {
    lock: tokio::sync::Mutex<()>,
    done: Notify,
}

/// Audit outcome attached to a job: the record's sequence, or the reason the
/// append was escalated.
pub type AuditOutcome = std::result::Result<u64, String>;

pub struct JobEngine {
    store: Arc<dyn GatewayStore>,
    slots: Mutex<HashMap<JobId, Arc<JobSlot>>>,
}

impl JobEngine {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    fn slot(&self, id: &JobId) -> Arc<JobSlot> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.clone())
            .or_default()
            .clone()
    }

    /// Drop the slot once nobody but the map holds it.
    fn release(&self, id: &JobId, slot: Arc<JobSlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&slot) == 2 {
            slots.remove(id);
        }
    }

    /// Create a queued job with a fresh id.
    pub async fn create(&self, agent: &str) -> Result<JobRecord> {
        self.create_with_id(JobId::new(), agent, None).await
    }

    pub async fn create_with_id(
        &self,
        id: JobId,
        agent: &str,
        artifact_dir: Option<String>,
    ) -> Result<JobRecord> {
        let mut job = JobRecord::queued(id, agent);
        job.artifact_dir = artifact_dir;
        self.store.insert_job(&job).await?;
        obs::emit_job_transition(job.id.as_str(), agent, "-", JobState::Queued.as_str());
        Ok(job)
    }

    pub async fn mark_running(&self, id: &JobId) -> Result<JobRecord> {
        let slot = self.slot(id);
        let out = {
            let _held = slot.lock.lock().await;
            self.start(id).await
        };
        self.release(id, slot);
        out
    }

    async fn start(&self, id: &JobId) -> Result<JobRecord> {
        let mut job = self.store.get_job(id).await?;
        if job.state != JobState::Queued {
            return Err(reject(&job, JobState::Running, invalid(&job, JobState::Running)));
        }
        job.state = JobState::Running;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;
        obs::emit_job_transition(
            id.as_str(),
            &job.agent_name,
            JobState::Queued.as_str(),
            JobState::Running.as_str(),
        );
        Ok(job)
    }

    pub async fn mark_completed(&self, id: &JobId, result: Value) -> Result<JobRecord> {
        self.finish(id, JobState::Completed, Some(result), None).await
    }

    pub async fn mark_failed(&self, id: &JobId, error: impl Into<String>) -> Result<JobRecord> {
        self.finish(id, JobState::Failed, None, Some(error.into()))
            .await
    }

    pub async fn mark_timed_out(&self, id: &JobId, error: impl Into<String>) -> Result<JobRecord> {
        self.finish(id, JobState::TimedOut, None, Some(error.into()))
            .await
    }

    async fn finish(
        &self,
        id: &JobId,
        to: JobState,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<JobRecord> {
        let slot = self.slot(id);
        let out = {
            let _held = slot.lock.lock().await;
            self.settle(id, to, result, error).await
        };
        if matches!(out, Ok((_, true))) {
            slot.done.notify_waiters();
        }
        self.release(id, slot);
        out.map(|(job, _)| job)
    }

    /// Returns the record and whether this call changed it.
    async fn settle(
        &self,
        id: &JobId,
        to: JobState,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(JobRecord, bool)> {
        let mut job = self.store.get_job(id).await?;
        match job.state {
            JobState::Running => {
                let from = job.state;
                job.state = to;
                job.result = result;
                job.error = error;
                job.updated_at = Utc::now();
                self.store.update_job(&job).await?;

                if to == JobState::Completed {
                    METRICS.inc_jobs_completed();
                } else {
                    METRICS.inc_jobs_failed();
                }
                obs::emit_job_transition(id.as_str(), &job.agent_name, from.as_str(), to.as_str());
                Ok((job, true))
            }
            state if state.is_terminal() => {
                if state == to && same_bytes(&job.result, &result) && same_bytes(&job.error, &error)
                {
                    return Ok((job, false));
                }
                let err = GatewayError::Conflict {
                    job_id: id.to_string(),
                    state: state.as_str().to_string(),
                };
                Err(reject(&job, to, err))
            }
            _ => Err(reject(&job, to, invalid(&job, to))),
        }
    }

    /// Replace the progress snapshot of a running job.
    pub async fn update_progress(&self, id: &JobId, progress: Value) -> Result<JobRecord> {
        let slot = self.slot(id);
        let out = {
            let _held = slot.lock.lock().await;
            self.write_progress(id, progress).await
        };
        self.release(id, slot);
        out
    }

    async fn write_progress(&self, id: &JobId, progress: Value) -> Result<JobRecord> {
        let mut job = self.store.get_job(id).await?;
        if job.state != JobState::Running {
            let err = GatewayError::InvalidTransition {
                job_id: id.to_string(),
                from: job.state.as_str().to_string(),
                to: "progress".into(),
            };
            obs::emit_job_rejected(id.as_str(), "progress", &err);
            return Err(err);
        }
        job.progress = Some(progress);
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;
        Ok(job)
    }

    /// Attach the audit outcome. Metadata only, allowed in any state.
    pub async fn record_audit(&self, id: &JobId, outcome: AuditOutcome) -> Result<JobRecord> {
        let slot = self.slot(id);
        let out = {
            let _held = slot.lock.lock().await;
            self.write_audit(id, outcome).await
        };
        self.release(id, slot);
        out
    }

    async fn write_audit(&self, id: &JobId, outcome: AuditOutcome) -> Result<JobRecord> {
        let mut job = self.store.get_job(id).await?;
        match outcome {
            Ok(sequence) => job.audit_sequence = Some(sequence),
            Err(reason) => job.audit_error = Some(reason),
        }
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> Result<JobRecord> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list(&self, agent: Option<&str>) -> Result<Vec<JobRecord>> {
        Ok(self.store.list_jobs(agent).await?)
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Returns `Timeout` if it is still queued or running after `timeout`;
    /// the job itself is left untouched.
    pub async fn wait_for_terminal(&self, id: &JobId, timeout: Duration) -> Result<JobRecord> {
        let deadline = Instant::now() + timeout;
        let slot = self.slot(id);

        let out = loop {
            let notified = slot.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = match self.store.get_job(id).await {
                Ok(job) => job,
                Err(e) => break Err(e.into()),
            };
            if job.state.is_terminal() {
                break Ok(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Err(GatewayError::timeout(format!("wait for {id}"), timeout));
            }
        };

        self.release(id, slot);
        out
    }
}

fn invalid(job: &JobRecord, to: JobState) -> GatewayError {
    GatewayError::InvalidTransition {
        job_id: job.id.to_string(),
        from: job.state.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

fn reject(job: &JobRecord, attempted: JobState, err: GatewayError) -> GatewayError {
    obs::emit_job_rejected(job.id.as_str(), attempted.as_str(), &err);
    err
}

fn same_bytes<T: serde::Serialize>(stored: &T, incoming: &T) -> bool {
    match (serde_json::to_vec(stored), serde_json::to_vec(incoming)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn byte_comparison_is_exact() {
        assert!(same_bytes(&Some(json!({"a": 1})), &Some(json!({"a": 1}))));
        assert!(!same_bytes(&Some(json!({"a": 1})), &Some(json!({"a": 1.0}))));
        assert!(!same_bytes(&Some("boom".to_string()), &Some("boom ".to_string())));
        assert!(same_bytes::<Option<String>>(&None, &None));
    }
}
