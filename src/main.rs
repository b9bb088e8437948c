//! Ticker Gateway Binary
//!
//! Entry point: initialize logging, load configuration, bring the gateway
//! up, bind the downstream listener, and serve until interrupted.
//!
//! ## Exit codes
//! - 0: clean shutdown
//! - 1: invalid configuration
//! - 2: cannot bind the listening port
//! - 3: upstream unreachable at start with UPSTREAM_FAIL_FAST=true

use std::sync::Arc;

use ticker_gateway::config::GatewayConfig;
use ticker_gateway::gateway::Gateway;
use ticker_gateway::http::create_router;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_BIND_FAILED: i32 = 2;
const EXIT_UPSTREAM_UNREACHABLE: i32 = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber with env filter; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    tracing::info!("Starting ticker gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let addr = format!("0.0.0.0:{}", config.downstream.port);
    let fail_fast = config.upstream.fail_fast;
    let gateway = Arc::new(Gateway::new(config));

    if let Err(err) = gateway.start().await {
        tracing::error!(error = %err, "gateway failed to start");
        if fail_fast {
            std::process::exit(EXIT_UPSTREAM_UNREACHABLE);
        }
        return Err(err.into());
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %addr, "cannot bind listening port");
            std::process::exit(EXIT_BIND_FAILED);
        }
    };
    tracing::info!(addr = %addr, "downstream listener ready");

    let app = create_router(gateway.clone());
    let shutdown_gateway = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_gateway.shutdown().await;
        })
        .await?;

    tracing::info!("ticker gateway stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
