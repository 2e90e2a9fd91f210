//! `eventbridge` entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file named by `--config` (or
//!    `EVENTBRIDGE_CONFIG`) and apply command-line overrides.
//! 2. **Wire observability**: `tracing-subscriber` with a JSON or pretty fmt
//!    layer and an optional OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the in-memory task registry and the HTTP
//!    transport, injected into the gateway, dispatcher and status reporter.
//! 4. **Run**: the dispatch worker pool and the HTTP listener, until SIGINT
//!    or SIGTERM. Shutdown stops accepting requests, lets in-flight attempts
//!    finish, then flushes exported spans.

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bridge::{Gateway, TaskStore};
use dispatcher::{Dispatcher, StatusReporter, WorkerPool};
use http_transport::HttpTransport;
use listener::AppState;
use registry::InMemoryTaskStore;

use crate::config::{BridgeConfig, LogFormat};

/// Bridges inbound events to outbound webhook deliveries.
#[derive(Debug, Parser)]
#[command(name = "eventbridge", version, about)]
struct Args {
    /// Configuration file. A missing file means built-in defaults.
    #[arg(long, env = "EVENTBRIDGE_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address; overrides `server.bind`.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log encoding; overrides `telemetry.log_format`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(format) = args.log_format {
        config.telemetry.log_format = format;
    }

    let telemetry = telemetry::init(&config.telemetry)?;
    let result = run(config).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "eventbridge stopped with an error");
    }
    telemetry.shutdown();
    result
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    info!(
        bind = %config.bind,
        workers = config.dispatch.workers,
        backoff = %config.dispatch.backoff,
        "Starting eventbridge"
    );
    if config.routes.is_empty() {
        warn!("No routes configured; every event will be rejected as unroutable");
    }

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let transport = Arc::new(HttpTransport::new().context("building HTTP client")?);
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        transport,
        config.dispatch.clone(),
    ));
    let shutdown = CancellationToken::new();
    let state = AppState {
        gateway: Gateway::new(store.clone(), config.routes.clone()),
        dispatcher: dispatcher.clone(),
        status: StatusReporter::new(store, config.dispatch.status_poll_interval),
        shutdown: shutdown.clone(),
    };

    let tcp = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    let workers = WorkerPool::spawn(dispatcher, shutdown.clone());

    // Cancelling on the signal stops the workers and ends open subscriptions
    // while the server drains.
    let token = shutdown.clone();
    let served = listener::serve(tcp, state, async move {
        tokio::select! {
            _ = shutdown_signal() => info!("Shutdown requested"),
            _ = token.cancelled() => {}
        }
        token.cancel();
    })
    .await;

    shutdown.cancel();
    workers.join().await;
    info!("eventbridge stopped");
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
