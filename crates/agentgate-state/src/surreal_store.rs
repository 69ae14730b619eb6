//! SurrealDB-backed job and audit store
//!
//! Uses `schema::JobRow` and `schema::AuditRow` for persistence, converting
//! to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{AuditRow, JobRow};
use crate::storage_traits::{
    AuditRecord, AuditStore, JobId, JobRecord, JobStore, StorageResult,
};

/// Connection settings for the durable backend.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Endpoint URL (`ws://`, `wss://`, `surrealkv://path`, `mem://`)
    pub endpoint: String,
    /// Namespace (default: "agentgate")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Credentials; `None` skips sign-in (embedded engines)
    pub credentials: Option<Credentials>,
}

/// Sign-in credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl SurrealConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "agentgate".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_root: bool,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root,
        });
        self
    }
}

/// SurrealDB-backed implementation of [`JobStore`] and [`AuditStore`].
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `agentgate/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&SurrealConfig::new("mem://")).await
    }

    /// Connect, sign in when credentials are given, select ns/db and run
    /// migrations.
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn connect(config: &SurrealConfig) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(config.endpoint.as_str())
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        if let Some(creds) = &config.credentials {
            if creds.is_root {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
            }
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        info!("SurrealStore connected ({})", config.endpoint);
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_job(&self, job_id: &str) -> StorageResult<Option<JobRow>> {
        let jid = job_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM jobs WHERE job_id = $jid")
            .bind(("jid", jid))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<JobRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn select_audit(
        &self,
        sql: &'static str,
        bound: Option<u64>,
    ) -> StorageResult<Vec<AuditRow>> {
        let query = self.db.query(sql);
        let query = match bound {
            Some(seq) => query.bind(("seq", seq)),
            None => query,
        };
        let mut res = query
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        res.take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl JobStore for SurrealStore {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        if self.fetch_job(job.id.as_str()).await?.is_some() {
            return Err(StorageError::DuplicateJob {
                job_id: job.id.to_string(),
            });
        }

        debug!(job_id = %job.id, "creating job");

        let _created: Option<JobRow> = self
            .db
            .create("jobs")
            .content(JobRow::from(job))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_job(&self, job: &JobRecord) -> StorageResult<()> {
        let jid = job.id.0.clone();
        let mut res = self
            .db
            .query("UPDATE jobs CONTENT $row WHERE job_id = $jid")
            .bind(("row", JobRow::from(job)))
            .bind(("jid", jid))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let updated: Vec<JobRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if updated.is_empty() {
            return Err(StorageError::JobNotFound {
                job_id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StorageResult<JobRecord> {
        let row = self
            .fetch_job(id.as_str())
            .await?
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: id.to_string(),
            })?;
        JobRecord::try_from(row)
    }

    async fn list_jobs(&self, agent_name: Option<&str>) -> StorageResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = if let Some(agent) = agent_name {
            let agent = agent.to_string();
            let mut res = self
                .db
                .query("SELECT * FROM jobs WHERE agent_name = $agent ORDER BY created_at DESC")
                .bind(("agent", agent))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM jobs ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}

#[async_trait]
impl AuditStore for SurrealStore {
    async fn append_audit(&self, record: &AuditRecord) -> StorageResult<()> {
        let expected = self.last_audit().await?.map_or(0, |r| r.sequence + 1);
        if record.sequence != expected {
            return Err(StorageError::SequenceConflict {
                expected,
                actual: record.sequence,
            });
        }

        let _created: Option<AuditRow> = self
            .db
            .create("audit_log")
            .content(AuditRow::from(record))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn last_audit(&self) -> StorageResult<Option<AuditRecord>> {
        let rows = self
            .select_audit("SELECT * FROM audit_log ORDER BY sequence DESC LIMIT 1", None)
            .await?;
        rows.into_iter().next().map(AuditRecord::try_from).transpose()
    }

    async fn get_audit(&self, sequence: u64) -> StorageResult<Option<AuditRecord>> {
        let rows = self
            .select_audit("SELECT * FROM audit_log WHERE sequence = $seq", Some(sequence))
            .await?;
        rows.into_iter().next().map(AuditRecord::try_from).transpose()
    }

    async fn audit_from(&self, from: u64) -> StorageResult<Vec<AuditRecord>> {
        let rows = self
            .select_audit(
                "SELECT * FROM audit_log WHERE sequence >= $seq ORDER BY sequence ASC",
                Some(from),
            )
            .await?;
        rows.into_iter().map(AuditRecord::try_from).collect()
    }
}
