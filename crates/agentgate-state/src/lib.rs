//! agentgate-state: persistence for the agent gateway
//!
//! This crate owns every byte the gateway keeps beyond a single request:
//! invocation (job) records and the hash-chained audit log.
//!
//! ## Key Components
//!
//! - `JobStore` / `AuditStore`: backend-agnostic async traits
//! - `SurrealStore`: durable SurrealDB backend (ws, surrealkv or mem engines)
//! - `MemoryStore`: in-process fallback, also used by tests
//! - `connect_store`: picks one of the above at startup

pub mod backend;
mod error;
pub mod memory;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use backend::{connect_store, StoreMode, StoreOptions};
pub use error::{StateError, StorageError};
pub use memory::MemoryStore;
pub use storage_traits::{
    AuditRecord, AuditStore, ContentDigest, GatewayStore, JobId, JobRecord, JobState, JobStore,
    StorageResult,
};
pub use surreal_store::{Credentials, SurrealConfig, SurrealStore};

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
