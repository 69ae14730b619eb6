//! In-memory store
//!
//! `MemoryStore` satisfies the `JobStore` and `AuditStore` contracts without
//! any external dependency. It backs tests and is the degraded fallback when
//! the durable backend is unreachable; all state is lost on restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, JobRecord>,
    audit: Vec<AuditRecord>,
}

/// In-memory job table and audit log.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite a stored audit record in place. Only useful for exercising
    /// tamper detection.
    #[doc(hidden)]
    pub fn tamper_audit(&self, record: AuditRecord) {
        let mut t = self.tables();
        if let Some(slot) = t.audit.get_mut(record.sequence as usize) {
            *slot = record;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        let mut t = self.tables();
        if t.jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateJob {
                job_id: job.id.to_string(),
            });
        }
        t.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &JobRecord) -> StorageResult<()> {
        let mut t = self.tables();
        match t.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StorageError::JobNotFound {
                job_id: job.id.to_string(),
            }),
        }
    }

    async fn get_job(&self, id: &JobId) -> StorageResult<JobRecord> {
        self.tables()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: id.to_string(),
            })
    }

    async fn list_jobs(&self, agent_name: Option<&str>) -> StorageResult<Vec<JobRecord>> {
        let t = self.tables();
        let mut jobs: Vec<JobRecord> = t
            .jobs
            .values()
            .filter(|j| agent_name.map_or(true, |a| j.agent_name == a))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, record: &AuditRecord) -> StorageResult<()> {
        let mut t = self.tables();
        let expected = t.audit.len() as u64;
        if record.sequence != expected {
            return Err(StorageError::SequenceConflict {
                expected,
                actual: record.sequence,
            });
        }
        t.audit.push(record.clone());
        Ok(())
    }

    async fn last_audit(&self) -> StorageResult<Option<AuditRecord>> {
        Ok(self.tables().audit.last().cloned())
    }

    async fn get_audit(&self, sequence: u64) -> StorageResult<Option<AuditRecord>> {
        Ok(self.tables().audit.get(sequence as usize).cloned())
    }

    async fn audit_from(&self, from: u64) -> StorageResult<Vec<AuditRecord>> {
        let t = self.tables();
        Ok(t.audit.iter().skip(from as usize).cloned().collect())
    }
}
