//! rentflowd - settlement and lease activation daemon
//!
//! Serves the lease/obligation REST API, runs the periodic reconciliation
//! sweep and forwards lease activations to the user-management side.

use anyhow::Context;
use clap::Parser;
use rentflow_core::ChannelActivationSink;
use rentflow_service::config::DaemonConfig;
use rentflow_service::scheduler::ReconcileScheduler;
use rentflow_service::{build_router, ServiceState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// rentflowd CLI
#[derive(Parser)]
#[command(name = "rentflowd")]
#[command(about = "RentFlow payment settlement and lease activation daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RENTFLOW_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides server.listen_addr
    #[arg(short, long, env = "RENTFLOW_LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    /// Log level, overrides logging.level
    #[arg(long, env = "RENTFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "RENTFLOW_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        DaemonConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let (sink, mut activations) = ChannelActivationSink::new(64);
    tokio::spawn(async move {
        while let Some(signal) = activations.recv().await {
            tracing::info!(
                lease_id = %signal.lease_id,
                tenant_user_id = %signal.tenant_user_id,
                activated_at = %signal.activated_at,
                "promote tenant role"
            );
        }
    });

    let state = ServiceState::bootstrap(&config, Arc::new(sink))
        .await
        .context("failed to start settlement engine")?;

    let scheduler = if config.scheduler.enabled {
        let (scheduler, trigger_rx) =
            ReconcileScheduler::new(config.scheduler.clone(), state.engine.clone());
        tokio::spawn(scheduler.clone().start(trigger_rx));
        Some(scheduler)
    } else {
        tracing::warn!("reconciliation scheduler disabled");
        None
    };

    let app = build_router(state, config.server.enable_cors);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    tracing::info!(
        addr = %config.server.listen_addr,
        version = env!("CARGO_PKG_VERSION"),
        "rentflowd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("rentflowd shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
