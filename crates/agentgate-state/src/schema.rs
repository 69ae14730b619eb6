//! Row shapes for the agentgate SurrealDB tables
//!
//! Tables:
//! - jobs: one row per invocation
//! - audit_log: append-only hash chain
//!
//! Rows are converted to and from `storage_traits` types at the boundary so
//! that SurrealDB datetimes and string-encoded enums never leak out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{AuditRecord, ContentDigest, JobId, JobRecord, JobState};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row in the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub job_id: String,
    pub agent_name: String,
    /// "queued" | "running" | "completed" | "failed" | "timed_out"
    pub state: String,
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifact_dir: Option<String>,
    #[serde(default)]
    pub audit_sequence: Option<u64>,
    #[serde(default)]
    pub audit_error: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobRow {
    fn from(job: &JobRecord) -> Self {
        JobRow {
            id: None,
            job_id: job.id.0.clone(),
            agent_name: job.agent_name.clone(),
            state: job.state.as_str().to_string(),
            progress: job.progress.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            artifact_dir: job.artifact_dir.clone(),
            audit_sequence: job.audit_sequence,
            audit_error: job.audit_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::parse(&row.state)
            .ok_or_else(|| StorageError::Backend(format!("unknown job state: {}", row.state)))?;
        Ok(JobRecord {
            id: JobId(row.job_id),
            agent_name: row.agent_name,
            state,
            progress: row.progress,
            result: row.result,
            error: row.error,
            artifact_dir: row.artifact_dir,
            audit_sequence: row.audit_sequence,
            audit_error: row.audit_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row in the `audit_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub sequence: u64,
    pub job_id: String,
    pub agent_name: String,
    pub request_digest: String,
    pub response_digest: String,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl From<&AuditRecord> for AuditRow {
    fn from(r: &AuditRecord) -> Self {
        AuditRow {
            id: None,
            sequence: r.sequence,
            job_id: r.job_id.0.clone(),
            agent_name: r.agent_name.clone(),
            request_digest: r.request_digest.as_str().to_string(),
            response_digest: r.response_digest.as_str().to_string(),
            timestamp: r.timestamp,
            prev_hash: r.prev_hash.clone(),
            hash: r.hash.clone(),
        }
    }
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditRecord {
            sequence: row.sequence,
            job_id: JobId(row.job_id),
            agent_name: row.agent_name,
            request_digest: ContentDigest::try_from(row.request_digest)?,
            response_digest: ContentDigest::try_from(row.response_digest)?,
            timestamp: row.timestamp,
            prev_hash: row.prev_hash,
            hash: row.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_row_round_trips_state_and_payloads() {
        let mut job = JobRecord::queued(JobId::new(), "hello").with_artifact_dir("/a/b");
        job.state = JobState::TimedOut;
        job.error = Some("agent did not answer".into());
        job.progress = Some(json!({"step": 2}));

        let row = JobRow::from(&job);
        assert_eq!(row.state, "timed_out");
        assert!(row.id.is_none());

        let back = JobRecord::try_from(row).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn job_row_rejects_unknown_state() {
        let mut row = JobRow::from(&JobRecord::queued(JobId::new(), "hello"));
        row.state = "paused".into();
        assert!(matches!(
            JobRecord::try_from(row),
            Err(StorageError::Backend(_))
        ));
    }

    #[test]
    fn audit_row_rejects_malformed_digest() {
        let row = AuditRow {
            id: None,
            sequence: 0,
            job_id: "j".into(),
            agent_name: "hello".into(),
            request_digest: "not-hex".into(),
            response_digest: ContentDigest::from_bytes(b"x").to_string(),
            timestamp: Utc::now(),
            prev_hash: "0".repeat(64),
            hash: "0".repeat(64),
        };
        assert!(matches!(
            AuditRecord::try_from(row),
            Err(StorageError::InvalidDigest { .. })
        ));
    }
}
