//! Command-line interface for `agentgated`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agentgate_core::{AgentsFile, GatewayConfig};
use agentgate_state::{StoreOptions, SurrealConfig};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "agentgated")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Control-plane gateway for containerized agents", long_about = None)]
pub struct Args {
    /// HTTP API listen address
    #[arg(long, env = "AGENTGATE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Egress proxy listen address
    #[arg(long, env = "AGENTGATE_PROXY_LISTEN", default_value = "0.0.0.0:3128")]
    pub proxy_listen: SocketAddr,

    /// Durable store endpoint (ws://, surrealkv://, mem://). Omit to run in memory.
    #[arg(long, env = "AGENTGATE_STORE_URL")]
    pub store_url: Option<String>,

    #[arg(long, env = "AGENTGATE_STORE_NAMESPACE", default_value = "agentgate")]
    pub store_namespace: String,

    #[arg(long, env = "AGENTGATE_STORE_DATABASE", default_value = "main")]
    pub store_database: String,

    #[arg(long, env = "AGENTGATE_STORE_USERNAME")]
    pub store_username: Option<String>,

    #[arg(long, env = "AGENTGATE_STORE_PASSWORD", hide_env_values = true)]
    pub store_password: Option<String>,

    /// Root of the per-thread artifact directories
    #[arg(long, env = "AGENTGATE_ARTIFACTS_DIR", default_value = "/artifacts")]
    pub artifacts_dir: PathBuf,

    /// Upload size limit per invocation, in MiB
    #[arg(long, env = "AGENTGATE_MAX_UPLOAD_MB", default_value_t = 200)]
    pub max_upload_mb: u64,

    /// Default idle timeout before an agent is stopped, in minutes
    #[arg(long, env = "AGENTGATE_IDLE_TIMEOUT_MIN", default_value_t = 15)]
    pub idle_timeout_min: u64,

    /// Agents file (TOML): egress allowlists and idle overrides
    #[arg(long, env = "AGENTGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Forward absolute-form http:// requests through the egress proxy
    #[arg(long, env = "AGENTGATE_ALLOW_PLAIN_HTTP")]
    pub allow_plain_http: bool,

    /// Let the egress proxy identify agents by the X-Agent-Name header
    #[arg(long, env = "AGENTGATE_TRUST_AGENT_HEADER")]
    pub trust_agent_header: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Defaults overlaid with the flags; `agents` comes from `--config`.
    pub fn gateway_config(&self, agents: AgentsFile) -> GatewayConfig {
        let mut config = GatewayConfig {
            agents,
            ..GatewayConfig::default()
        };
        config.lifecycle.default_idle_timeout =
            Duration::from_secs(self.idle_timeout_min.saturating_mul(60));
        config.invoke.artifacts_root = self.artifacts_dir.clone();
        config.invoke.max_upload_bytes = self.max_upload_mb * 1024 * 1024;
        config.proxy.listen = self.proxy_listen;
        config.proxy.allow_plain_http = self.allow_plain_http;
        config.proxy.trust_agent_header = self.trust_agent_header;
        config
    }

    pub fn store_options(&self) -> StoreOptions {
        let surreal = self.store_url.as_ref().map(|url| {
            let cfg = SurrealConfig::new(url.clone())
                .with_namespace(self.store_namespace.clone())
                .with_database(self.store_database.clone());
            match (&self.store_username, &self.store_password) {
                (Some(user), Some(pass)) => cfg.with_credentials(user.clone(), pass.clone(), true),
                _ => cfg,
            }
        });
        StoreOptions {
            surreal,
            ..StoreOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["agentgated"]);
        assert_eq!(args.listen.port(), 8080);
        assert_eq!(args.proxy_listen.port(), 3128);
        assert!(args.store_options().surreal.is_none());

        let config = args.gateway_config(AgentsFile::default());
        assert_eq!(config.lifecycle.default_idle_timeout, Duration::from_secs(900));
        assert_eq!(config.invoke.max_upload_bytes, 200 * 1024 * 1024);
        assert!(!config.proxy.allow_plain_http);
    }

    #[test]
    fn store_flags_build_surreal_config() {
        let args = Args::parse_from([
            "agentgated",
            "--store-url",
            "ws://db:8000",
            "--store-username",
            "root",
            "--store-password",
            "secret",
            "--idle-timeout-min",
            "5",
        ]);
        let surreal = args.store_options().surreal.unwrap();
        assert_eq!(surreal.endpoint, "ws://db:8000");
        assert_eq!(surreal.namespace, "agentgate");
        assert_eq!(surreal.credentials.unwrap().username, "root");
        assert_eq!(
            args.gateway_config(AgentsFile::default())
                .lifecycle
                .default_idle_timeout,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn huge_idle_flag_saturates() {
        let args = Args::parse_from(["agentgated", "--idle-timeout-min", &u64::MAX.to_string()]);
        let config = args.gateway_config(AgentsFile::default());
        assert_eq!(
            config.lifecycle.default_idle_timeout,
            Duration::from_secs(u64::MAX)
        );
    }
}
