//! Startup backend selection.
//!
//! The gateway picks exactly one backend when it boots and injects it as
//! `Arc<dyn GatewayStore>`. An unreachable durable store degrades to the
//! in-memory store instead of failing startup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::memory::MemoryStore;
use crate::storage_traits::GatewayStore;
use crate::surreal_store::{SurrealConfig, SurrealStore};

/// Which backend ended up serving the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Records survive restarts.
    Durable,
    /// No durable store was configured.
    InMemory,
    /// A durable store was configured but could not be reached.
    InMemoryFallback,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreMode::Durable => "durable",
            StoreMode::InMemory => "memory",
            StoreMode::InMemoryFallback => "memory_fallback",
        }
    }

    pub fn is_durable(self) -> bool {
        matches!(self, StoreMode::Durable)
    }
}

/// Connection options for [`connect_store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Durable backend; `None` runs in memory from the start.
    pub surreal: Option<SurrealConfig>,
    /// Total connection attempts before falling back.
    pub connect_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            surreal: None,
            connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Connect the configured backend, retrying a bounded number of times, and
/// fall back to [`MemoryStore`] when it stays unreachable.
pub async fn connect_store(options: &StoreOptions) -> (Arc<dyn GatewayStore>, StoreMode) {
    let Some(config) = &options.surreal else {
        info!(event = "store.memory", "no durable store configured, using in-memory store");
        return (Arc::new(MemoryStore::new()), StoreMode::InMemory);
    };

    let attempts = options.connect_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match SurrealStore::connect(config).await {
            Ok(store) => return (Arc::new(store), StoreMode::Durable),
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    info!(attempt, attempts, error = %e, "durable store not ready, retrying");
                    tokio::time::sleep(options.retry_delay).await;
                }
            }
        }
    }

    warn!(
        event = "store.degraded",
        endpoint = %config.endpoint,
        error = %last_error,
        "durable store unreachable; jobs and audit records will not survive a restart"
    );
    (Arc::new(MemoryStore::new()), StoreMode::InMemoryFallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_config_runs_in_memory() {
        let (_store, mode) = connect_store(&StoreOptions::default()).await;
        assert_eq!(mode, StoreMode::InMemory);
        assert!(!mode.is_durable());
    }

    #[tokio::test]
    async fn embedded_engine_is_durable_mode() {
        let options = StoreOptions {
            surreal: Some(SurrealConfig::new("mem://")),
            ..StoreOptions::default()
        };
        let (_store, mode) = connect_store(&options).await;
        assert_eq!(mode, StoreMode::Durable);
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back() {
        let options = StoreOptions {
            surreal: Some(SurrealConfig::new("ws://127.0.0.1:1")),
            connect_attempts: 2,
            retry_delay: Duration::from_millis(10),
        };
        let (_store, mode) = connect_store(&options).await;
        assert_eq!(mode, StoreMode::InMemoryFallback);
    }
}
