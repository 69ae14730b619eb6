//! Structured observability hooks for gateway lifecycle events.
//!
//! This module provides:
//! - Job-scoped tracing spans via [`job_span`]
//! - Emission functions for agent, job, audit, egress and discovery events
//!
//! Every event carries an `event` field so log pipelines can filter on it.

use std::fmt::Display;
use std::net::SocketAddr;

use tracing::{error, info, warn};

/// Span covering everything the gateway does for one job.
///
/// Attach it with `tracing::Instrument` so it follows the job across
/// await points:
///
/// ```ignore
/// run_job(id).instrument(obs::job_span(id.as_str(), "hello")).await;
/// ```
pub fn job_span(job_id: &str, agent: &str) -> tracing::Span {
    tracing::info_span!("agentgate.job", job_id = %job_id, agent = %agent)
}

pub fn emit_discovery_degraded(error: &dyn Display) {
    warn!(
        event = "discovery.degraded",
        error = %error,
        "container runtime unreachable, serving last known agents"
    );
}

pub fn emit_discovery_recovered() {
    info!(event = "discovery.recovered", "container runtime reachable again");
}

pub fn emit_agent_starting(agent: &str) {
    info!(event = "agent.starting", agent = %agent);
}

/// Emit event: agent accepted connections after a lazy start.
pub fn emit_agent_started(agent: &str, elapsed_ms: u64) {
    info!(event = "agent.started", agent = %agent, elapsed_ms = elapsed_ms);
}

pub fn emit_agent_start_failed(agent: &str, error: &dyn Display) {
    warn!(event = "agent.start_failed", agent = %agent, error = %error);
}

/// Emit event: idle agent stopped by the sweeper.
pub fn emit_agent_stopped(agent: &str, idle_secs: u64) {
    info!(event = "agent.stopped", agent = %agent, idle_secs = idle_secs);
}

pub fn emit_agent_stop_failed(agent: &str, error: &dyn Display) {
    warn!(event = "agent.stop_failed", agent = %agent, error = %error);
}

pub fn emit_job_transition(job_id: &str, agent: &str, from: &str, to: &str) {
    info!(event = "job.transition", job_id = %job_id, agent = %agent, from = %from, to = %to);
}

/// Emit event: a transition was refused (invalid or conflicting).
pub fn emit_job_rejected(job_id: &str, attempted: &str, error: &dyn Display) {
    warn!(event = "job.rejected", job_id = %job_id, attempted = %attempted, error = %error);
}

pub fn emit_audit_appended(sequence: u64, job_id: &str) {
    info!(event = "audit.appended", sequence = sequence, job_id = %job_id);
}

/// Emit event: audit append gave up; the invocation carries a warning.
pub fn emit_audit_unavailable(job_id: &str, attempts: u32, error: &dyn Display) {
    error!(
        event = "audit.unavailable",
        job_id = %job_id,
        attempts = attempts,
        error = %error,
    );
}

pub fn emit_egress_tunnel(agent: &str, host: &str, port: u16) {
    info!(event = "egress.tunnel", agent = %agent, host = %host, port = port);
}

pub fn emit_egress_denied(agent: Option<&str>, peer: SocketAddr, host: &str, reason: &str) {
    warn!(
        event = "egress.denied",
        agent = agent.unwrap_or("-"),
        peer = %peer,
        host = %host,
        reason = %reason,
    );
}
