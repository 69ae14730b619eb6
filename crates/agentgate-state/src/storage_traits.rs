//! Storage trait definitions for agentgate
//!
//! These traits define the two persistence concerns of the gateway:
//! - `JobStore`: invocation (thread) records and their state
//! - `AuditStore`: the append-only, hash-chained audit log
//!
//! Both are async and backend-agnostic. `MemoryStore` (see `memory`) is the
//! in-process fallback; `SurrealStore` is the durable backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Client-visible identifier of an invocation (also called the thread id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    /// Completed, Failed and TimedOut admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
        }
    }

    /// Parse the stored lowercase form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "timed_out" => Some(JobState::TimedOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full job record.
///
/// `result` is only set when `Completed`; `error` only when `Failed` or
/// `TimedOut`. The audit fields are metadata and may be set in any state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub agent_name: String,
    pub state: JobState,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Path of the thread's artifact directory, if one was prepared.
    pub artifact_dir: Option<String>,
    /// Sequence of the audit record covering this invocation.
    pub audit_sequence: Option<u64>,
    /// Set when the audit append was escalated as unavailable.
    pub audit_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh record in `Queued` state.
    pub fn queued(id: JobId, agent_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            agent_name: agent_name.into(),
            state: JobState::Queued,
            progress: None,
            result: None,
            error: None,
            artifact_dir: None,
            audit_sequence: None,
            audit_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<String>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }
}

/// Job persistence.
///
/// Guarantees:
/// - Job ids are unique; a second insert with the same id fails.
/// - `update_job` replaces the whole record of an existing job.
/// - Transition rules are enforced by the caller (the job engine), not here.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Returns `DuplicateJob` if the id exists.
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()>;

    /// Replace an existing job. Returns `JobNotFound` if absent.
    async fn update_job(&self, job: &JobRecord) -> StorageResult<()>;

    /// Fetch a job by id. Returns `JobNotFound` if absent.
    async fn get_job(&self, id: &JobId) -> StorageResult<JobRecord>;

    /// List jobs, newest first, optionally filtered by agent.
    async fn list_jobs(&self, agent_name: Option<&str>) -> StorageResult<Vec<JobRecord>>;
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// One link of the audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub job_id: JobId,
    pub agent_name: String,
    pub request_digest: ContentDigest,
    pub response_digest: ContentDigest,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// Append-only audit log.
///
/// Guarantees:
/// - Sequences start at 0 and are contiguous.
/// - `append_audit` rejects any record whose sequence is not exactly one past
///   the current tail with `SequenceConflict`.
/// - Records are never updated or deleted.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record at the tail of the log.
    async fn append_audit(&self, record: &AuditRecord) -> StorageResult<()>;

    /// The record with the highest sequence, if any.
    async fn last_audit(&self) -> StorageResult<Option<AuditRecord>>;

    /// The record at `sequence`, if present.
    async fn get_audit(&self, sequence: u64) -> StorageResult<Option<AuditRecord>>;

    /// All records with `sequence >= from`, ascending.
    async fn audit_from(&self, from: u64) -> StorageResult<Vec<AuditRecord>>;
}

/// Both stores behind one handle; the gateway picks one backend at startup.
pub trait GatewayStore: JobStore + AuditStore {}

impl<T: JobStore + AuditStore> GatewayStore for T {}
