//! Global atomic counters for gateway observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the idle sweeper does this on every tick).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Process-wide atomic counters.
pub struct Metrics {
    invocations: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    agents_started: AtomicU64,
    agents_stopped: AtomicU64,
    audit_appends: AtomicU64,
    audit_failures: AtomicU64,
    egress_tunnels: AtomicU64,
    egress_denied: AtomicU64,
}

/// Copy of every counter at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub agents_started: u64,
    pub agents_stopped: u64,
    pub audit_appends: u64,
    pub audit_failures: u64,
    pub egress_tunnels: u64,
    pub egress_denied: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            agents_started: AtomicU64::new(0),
            agents_stopped: AtomicU64::new(0),
            audit_appends: AtomicU64::new(0),
            audit_failures: AtomicU64::new(0),
            egress_tunnels: AtomicU64::new(0),
            egress_denied: AtomicU64::new(0),
        }
    }

    counter!(inc_invocations, invocations);
    counter!(inc_jobs_completed, jobs_completed);
    counter!(inc_jobs_failed, jobs_failed);
    counter!(inc_agents_started, agents_started);
    counter!(inc_agents_stopped, agents_stopped);
    counter!(inc_audit_appends, audit_appends);
    counter!(inc_audit_failures, audit_failures);
    counter!(inc_egress_tunnels, egress_tunnels);
    counter!(inc_egress_denied, egress_denied);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            agents_started: self.agents_started.load(Ordering::Relaxed),
            agents_stopped: self.agents_stopped.load(Ordering::Relaxed),
            audit_appends: self.audit_appends.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            egress_tunnels: self.egress_tunnels.load(Ordering::Relaxed),
            egress_denied: self.egress_denied.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            invocations = s.invocations,
            jobs_completed = s.jobs_completed,
            jobs_failed = s.jobs_failed,
            agents_started = s.agents_started,
            agents_stopped = s.agents_stopped,
            audit_appends = s.audit_appends,
            audit_failures = s.audit_failures,
            egress_tunnels = s.egress_tunnels,
            egress_denied = s.egress_denied,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_invocations();
        m.inc_invocations();
        m.inc_egress_denied();

        let s = m.snapshot();
        assert_eq!(s.invocations, 2);
        assert_eq!(s.egress_denied, 1);
        assert_eq!(s.jobs_completed, 0);
        m.flush();
    }
}
