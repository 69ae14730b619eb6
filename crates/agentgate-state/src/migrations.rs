//! SurrealDB schema migrations and initialization
//!
//! Sets up the `jobs` and `audit_log` tables with their uniqueness
//! constraints and lookup indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all agentgate tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing agentgate SurrealDB schema");

    init_jobs_table(db).await?;
    init_audit_log_table(db).await?;

    info!("agentgate schema initialization complete");
    Ok(())
}

/// Initialize `jobs` table
///
/// Schema:
/// ```text
/// TABLE jobs {
///   job_id:          STRING (unique)
///   agent_name:      STRING (indexed)
///   state:           STRING (queued | running | completed | failed | timed_out)
///   progress:        OBJECT?
///   result:          OBJECT?
///   error:           STRING?
///   artifact_dir:    STRING?
///   audit_sequence:  INT?
///   audit_error:     STRING?
///   created_at:      DATETIME (indexed)
///   updated_at:      DATETIME
/// }
/// ```
///
/// Transition rules (Queued → Running → terminal) are enforced by the job
/// engine; rows are replaced wholesale on update.
async fn init_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing jobs table");

    let sql = r#"
        DEFINE TABLE jobs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_job_id ON TABLE jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX idx_job_agent ON TABLE jobs COLUMNS agent_name;
        DEFINE INDEX idx_job_created_at ON TABLE jobs COLUMNS created_at;
    "#;

    db.query(sql).await?;
    info!("✓ jobs table initialized");
    Ok(())
}

/// Initialize `audit_log` table
///
/// Schema:
/// ```text
/// TABLE audit_log {
///   sequence:         INT (unique, contiguous from 0)
///   job_id:           STRING (indexed)
///   agent_name:       STRING
///   request_digest:   STRING
///   response_digest:  STRING
///   timestamp:        DATETIME
///   prev_hash:        STRING
///   hash:             STRING
/// }
/// ```
///
/// Append-only: updates and deletes are not permitted.
async fn init_audit_log_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing audit_log table");

    let sql = r#"
        DEFINE TABLE audit_log AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_audit_sequence ON TABLE audit_log COLUMNS sequence UNIQUE;
        DEFINE INDEX idx_audit_job_id ON TABLE audit_log COLUMNS job_id;
    "#;

    db.query(sql).await?;
    info!("✓ audit_log table initialized");
    Ok(())
}
