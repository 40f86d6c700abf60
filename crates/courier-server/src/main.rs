//! # Courier Server
//!
//! Multi-transport pub/sub relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with environment variables
//! COURIER_HTTP_PORT=8080 COURIER_HOST=0.0.0.0 courier
//! ```

mod config;
mod http;
mod metrics;
mod polling;
mod tcp;

use anyhow::Result;
use courier_core::Broker;
use http::AppState;
use polling::PollingSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Courier on {}:{} (http) and {}:{} (tcp)",
        config.host,
        config.http_port,
        config.host,
        config.tcp_port
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)
            .map_err(|error| anyhow::anyhow!("metrics exporter failed: {error}"))?;
    }

    let broker = Arc::new(Broker::new(config.broker_config()));
    let polling = PollingSupervisor::new(
        Arc::clone(&broker),
        Duration::from_secs(config.polling.expiry_secs),
    );

    let state = Arc::new(AppState {
        broker,
        polling,
        config,
    });

    if state.config.transport.tcp {
        let tcp_state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(error) = tcp::run_tcp_server(tcp_state).await {
                tracing::error!(%error, "TCP server exited");
            }
        });
    }

    http::run_http_server(state).await?;

    Ok(())
}
