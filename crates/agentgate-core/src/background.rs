//! Periodic loops: discovery refresh and idle sweep.
//!
//! Both stop when the shared `watch` channel flips to `true`. Ticks that
//! fall behind are delayed rather than bunched up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::lifecycle::LifecycleManager;
use crate::metrics::METRICS;
use crate::registry::Registry;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) -> bool {
    shutdown.changed().await.is_err() || *shutdown.borrow()
}

/// Refresh the registry every `period`. The first refresh runs at once.
pub fn spawn_discovery(
    registry: Arc<Registry>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are reported by the registry on transition.
                    if let Ok(count) = registry.refresh().await {
                        debug!(agents = count, "discovery refreshed");
                    }
                }
                done = stopped(&mut shutdown) => if done { break },
            }
        }
        info!("discovery loop stopped");
    })
}

/// Stop idle agents every `period` and flush the counters.
pub fn spawn_idle_sweeper(
    lifecycle: LifecycleManager,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        // The immediate first tick would sweep before any agent was used.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stopped_agents = lifecycle.sweep().await;
                    if !stopped_agents.is_empty() {
                        debug!(agents = ?stopped_agents, "idle sweep stopped agents");
                    }
                    METRICS.flush();
                }
                done = stopped(&mut shutdown) => if done { break },
            }
        }
        info!("idle sweeper stopped");
    })
}
