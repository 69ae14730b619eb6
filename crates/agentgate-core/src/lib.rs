//! agentgate-core: control plane for containerized agents
//!
//! ## Key Components
//!
//! - `Registry`: discovers agent containers through a `ContainerRuntime`
//! - `LifecycleManager`: lazy start (one start per agent, shared by all
//!   waiters) and idle stop
//! - `JobEngine`: the invocation state machine behind status/result polling
//! - `AuditChain`: hash-linked record of every invocation
//! - `EgressProxy`: CONNECT proxy enforcing per-agent host allowlists
//! - `Gateway`: ties the above together for the HTTP layer

pub mod agent_client;
pub mod artifacts;
pub mod audit;
pub mod background;
pub mod config;
pub mod egress;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod telemetry;

pub use agent_client::{AgentClient, AgentReply, HttpAgentClient, THREAD_ID_HEADER};
pub use artifacts::{ArtifactEntry, ArtifactStore, ThreadDirs};
pub use audit::{AuditChain, ChainReport, GENESIS_HASH};
pub use config::{
    AgentPolicy, AgentsFile, DiscoveryConfig, GatewayConfig, InvokeConfig, LifecycleConfig,
    ProxyConfig,
};
pub use egress::{AllowlistTable, EgressPolicy, EgressProxy, HostPattern};
pub use error::{ErrorKind, GatewayError, Result};
pub use gateway::{
    AgentFilter, AgentSummary, Gateway, HealthReport, InvokeOutcome, InvokeRequest, JobResult,
    Upload,
};
pub use jobs::JobEngine;
pub use lifecycle::{ActivityGuard, IdlePolicy, LifecycleManager};
pub use metrics::{MetricsSnapshot, METRICS};
pub use registry::{AgentDescriptor, AgentState, DiscoveryHealth, Registry};
pub use retry::RetryPolicy;
pub use runtime::{AgentEndpoint, ContainerInfo, ContainerRuntime, DockerRuntime, FakeRuntime};
