//! Outbound traffic control for agents.

pub mod allowlist;
pub mod proxy;

pub use allowlist::{normalize_host, AllowlistTable, EgressPolicy, EgressRule, HostPattern};
pub use proxy::{EgressProxy, SourceResolver, TcpDialer, UpstreamDialer};
