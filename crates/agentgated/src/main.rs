//! agentgated entry point.

use std::sync::Arc;
use std::time::Duration;

use agentgate_core::background::{spawn_discovery, spawn_idle_sweeper};
use agentgate_core::egress::SourceResolver;
use agentgate_core::{
    telemetry, AgentsFile, DockerRuntime, EgressProxy, Gateway, HttpAgentClient,
};
use agentgate_state::connect_store;
use agentgated::{router, AppState, Args};
use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(args.json, level);

    let agents = AgentsFile::load_optional(args.config.as_deref())
        .context("failed to load agents file")?;
    let config = args.gateway_config(agents);

    let (store, mode) = connect_store(&args.store_options()).await;
    info!(persistence = mode.as_str(), "store ready");

    let runtime = DockerRuntime::connect_local(config.discovery.clone())
        .context("failed to configure the container runtime client")?;
    let client = HttpAgentClient::new(config.invoke.invoke_timeout)?;
    let gateway = Gateway::new(
        config.clone(),
        Arc::new(runtime),
        store,
        mode,
        Arc::new(client),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let discovery = spawn_discovery(
        gateway.registry().clone(),
        config.discovery.refresh_interval,
        shutdown_rx.clone(),
    );
    let sweeper = spawn_idle_sweeper(
        gateway.lifecycle().clone(),
        config.lifecycle.sweep_interval,
        shutdown_rx.clone(),
    );

    let resolver: Arc<dyn SourceResolver> = gateway.registry().clone();
    let proxy = Arc::new(EgressProxy::with_tcp_dialer(
        config.proxy.clone(),
        gateway.allowlist().clone(),
        resolver,
    ));
    let proxy_listener = TcpListener::bind(config.proxy.listen)
        .await
        .with_context(|| format!("failed to bind egress proxy on {}", config.proxy.listen))?;
    let proxy_task = tokio::spawn(proxy.serve(proxy_listener, shutdown_rx.clone()));

    #[cfg(unix)]
    spawn_reload_on_hangup(gateway.clone(), args.config.clone());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind HTTP API on {}", args.listen))?;
    info!(addr = %args.listen, "HTTP API listening");

    axum::serve(listener, router(AppState::new(gateway)))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("HTTP server failed")?;

    let drain = async {
        let _ = discovery.await;
        let _ = sweeper.await;
        if let Ok(Err(e)) = proxy_task.await {
            warn!(error = %e, "egress proxy exited with an error");
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("background tasks did not stop in time");
    }
    Ok(())
}

/// Re-read the agents file on SIGHUP. A bad file keeps the current policy.
#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Gateway, path: Option<std::path::PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let result = AgentsFile::load_optional(path.as_deref())
                .and_then(|agents| gateway.reload(agents));
            if let Err(e) = result {
                warn!(error = %e, "agents file reload rejected");
            }
        }
    });
}
