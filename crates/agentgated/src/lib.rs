//! agentgated: the gateway daemon.
//!
//! The binary wires a [`agentgate_core::Gateway`] to an axum router, the
//! egress proxy and the background discovery and idle loops. The router is
//! exported so it can be exercised without a socket.

pub mod cli;
pub mod http;

pub use cli::Args;
pub use http::{router, AppState};
