//! Hash-chained audit log.
//!
//! Every completed invocation appends one [`AuditRecord`]. Record `n` embeds
//! the hash of record `n - 1`; record 0 embeds [`GENESIS_HASH`]. Appends are
//! serialized through one async mutex that caches the chain head, and the
//! head only advances once the store has accepted the record.

use std::sync::Arc;

use agentgate_state::{
    AuditRecord, ContentDigest, GatewayStore, JobId, StorageError, StorageResult,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const TAG_TEXT: u8 = b's';
const TAG_U64: u8 = b'u';

fn frame(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update(bytes);
    hasher.update([0u8]);
}

/// Canonical timestamp rendering used inside the hash.
pub fn render_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hash of one record over its linked fields.
#[allow(clippy::too_many_arguments)]
pub fn compute_hash(
    prev_hash: &str,
    sequence: u64,
    job_id: &JobId,
    agent_name: &str,
    request_digest: &ContentDigest,
    response_digest: &ContentDigest,
    timestamp: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    frame(&mut hasher, TAG_TEXT, prev_hash.as_bytes());
    frame(&mut hasher, TAG_U64, &sequence.to_be_bytes());
    frame(&mut hasher, TAG_TEXT, job_id.as_str().as_bytes());
    frame(&mut hasher, TAG_TEXT, agent_name.as_bytes());
    frame(&mut hasher, TAG_TEXT, request_digest.as_str().as_bytes());
    frame(&mut hasher, TAG_TEXT, response_digest.as_str().as_bytes());
    frame(&mut hasher, TAG_TEXT, render_timestamp(timestamp).as_bytes());
    hex::encode(hasher.finalize())
}

fn record_hash(r: &AuditRecord) -> String {
    compute_hash(
        &r.prev_hash,
        r.sequence,
        &r.job_id,
        &r.agent_name,
        &r.request_digest,
        &r.response_digest,
        &r.timestamp,
    )
}

/// Result of [`AuditChain::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    /// Records that verified before the first break (or all of them).
    pub checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }

    fn broken(checked: u64, at: u64, reason: impl Into<String>) -> Self {
        Self {
            checked,
            broken_at: Some(at),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct ChainHead {
    next_sequence: u64,
    hash: String,
}

pub struct AuditChain {
    store: Arc<dyn GatewayStore>,
    head: Mutex<Option<ChainHead>>,
    retry: RetryPolicy,
}

impl AuditChain {
    pub fn new(store: Arc<dyn GatewayStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            head: Mutex::new(None),
            retry,
        }
    }

    async fn load_head(&self) -> std::result::Result<ChainHead, StorageError> {
        Ok(match self.store.last_audit().await? {
            Some(last) => ChainHead {
                next_sequence: last.sequence + 1,
                hash: last.hash,
            },
            None => ChainHead {
                next_sequence: 0,
                hash: GENESIS_HASH.to_string(),
            },
        })
    }

    /// Append the record for one invocation.
    ///
    /// Transient store failures are retried with backoff. When the retries
    /// run out the chain is left unchanged and `AuditUnavailable` is
    /// returned; the caller must surface it.
    pub async fn append(
        &self,
        job_id: &JobId,
        agent_name: &str,
        request_digest: ContentDigest,
        response_digest: ContentDigest,
    ) -> Result<AuditRecord> {
        let mut head = self.head.lock().await;

        let current = match head.clone() {
            Some(h) => h,
            None => {
                let loaded = retry_with_backoff(&self.retry, StorageError::is_transient, || {
                    self.load_head()
                })
                .await
                .map_err(|exhausted| {
                    self.escalate(job_id, exhausted.attempts, exhausted.last_error)
                })?;
                *head = Some(loaded.clone());
                loaded
            }
        };

        let timestamp = Utc::now().trunc_subsecs(3);
        let hash = compute_hash(
            &current.hash,
            current.next_sequence,
            job_id,
            agent_name,
            &request_digest,
            &response_digest,
            &timestamp,
        );
        let record = AuditRecord {
            sequence: current.next_sequence,
            job_id: job_id.clone(),
            agent_name: agent_name.to_string(),
            request_digest,
            response_digest,
            timestamp,
            prev_hash: current.hash,
            hash,
        };

        let appended = retry_with_backoff(&self.retry, StorageError::is_transient, || {
            self.append_once(&record)
        })
        .await;

        match appended {
            Ok(()) => {
                *head = Some(ChainHead {
                    next_sequence: record.sequence + 1,
                    hash: record.hash.clone(),
                });
                METRICS.inc_audit_appends();
                obs::emit_audit_appended(record.sequence, job_id.as_str());
                Ok(record)
            }
            Err(exhausted) => {
                if matches!(exhausted.last_error, Some(StorageError::SequenceConflict { .. })) {
                    // Someone else wrote to the log; re-read the tail next time.
                    debug!("audit head out of date, dropping cached head");
                    *head = None;
                }
                Err(self.escalate(job_id, exhausted.attempts, exhausted.last_error))
            }
        }
    }

    /// One append attempt. An attempt that timed out may still have been
    /// committed, so a conflict on our own sequence is checked against what
    /// the store holds there.
    async fn append_once(&self, record: &AuditRecord) -> StorageResult<()> {
        match self.store.append_audit(record).await {
            Err(conflict @ StorageError::SequenceConflict { .. }) => {
                match self.store.get_audit(record.sequence).await? {
                    Some(stored) if stored.hash == record.hash => {
                        debug!(sequence = record.sequence, "audit record already committed");
                        Ok(())
                    }
                    _ => Err(conflict),
                }
            }
            other => other,
        }
    }

    fn escalate(
        &self,
        job_id: &JobId,
        attempts: u32,
        last: Option<StorageError>,
    ) -> GatewayError {
        let reason = match last {
            Some(e) => e.to_string(),
            None => "store did not answer in time".to_string(),
        };
        METRICS.inc_audit_failures();
        obs::emit_audit_unavailable(job_id.as_str(), attempts, &reason);
        GatewayError::AuditUnavailable(reason)
    }

    /// Recompute hashes and linkage for every record with `sequence >= from`.
    pub async fn verify(&self, from: u64) -> Result<ChainReport> {
        let mut prev_hash = if from == 0 {
            GENESIS_HASH.to_string()
        } else {
            match self.store.get_audit(from - 1).await? {
                Some(anchor) => anchor.hash,
                None => return Ok(ChainReport::broken(0, from - 1, "anchor record missing")),
            }
        };

        let records = self.store.audit_from(from).await?;
        let mut expected = from;
        let mut checked = 0u64;
        for record in records {
            if record.sequence != expected {
                return Ok(ChainReport::broken(checked, expected, "sequence gap"));
            }
            if record.prev_hash != prev_hash {
                let reason = "prev_hash does not match predecessor";
                return Ok(ChainReport::broken(checked, expected, reason));
            }
            if record_hash(&record) != record.hash {
                let reason = "hash does not match contents";
                return Ok(ChainReport::broken(checked, expected, reason));
            }
            prev_hash = record.hash;
            expected += 1;
            checked += 1;
        }

        Ok(ChainReport {
            checked,
            broken_at: None,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(s: &str) -> ContentDigest {
        ContentDigest::from_bytes(s.as_bytes())
    }

    #[test]
    fn hash_covers_every_field() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let job = JobId::from("t-1");
        let hash = |seq: u64, agent: &str, req: &str, resp: &str| {
            compute_hash(GENESIS_HASH, seq, &job, agent, &digest(req), &digest(resp), &ts)
        };
        let base = hash(0, "hello", "a", "b");

        assert_eq!(base.len(), 64);
        assert_ne!(base, hash(1, "hello", "a", "b"));
        assert_ne!(base, hash(0, "hellp", "a", "b"));
        assert_ne!(base, hash(0, "hello", "b", "a"));
        assert_eq!(base, hash(0, "hello", "a", "b"));
    }

    #[test]
    fn field_boundaries_are_framed() {
        let ts = Utc::now().trunc_subsecs(3);
        let (x, y) = (digest("x"), digest("y"));
        let a = compute_hash(GENESIS_HASH, 0, &JobId::from("ab"), "c", &x, &y, &ts);
        let b = compute_hash(GENESIS_HASH, 0, &JobId::from("a"), "bc", &x, &y, &ts);
        assert_ne!(a, b);
    }

    #[test]
    fn timestamps_render_with_millis() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.6789Z")
            .unwrap()
            .with_timezone(&Utc)
            .trunc_subsecs(3);
        assert_eq!(render_timestamp(&ts), "2026-01-02T03:04:05.678Z");
    }
}
