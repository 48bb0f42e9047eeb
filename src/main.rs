//! Swap Coordinator - one actor's atomic swap daemon
//!
//! Hosts the swap engine for a single party behind the operator HTTP API,
//! with its ledgers simulated in-process.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

use swap_coordinator::api;
use swap_coordinator::config::Settings;
use swap_coordinator::coordination::SwapEngine;
use swap_coordinator::ledger::{simulated, ActorContext};
use swap_coordinator::logging;
use swap_coordinator::metrics::{self, MetricsServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    logging::init();

    info!("Starting Swap Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for actor {} with {} ledgers",
        settings.actor.name,
        settings.enabled_ledgers().len()
    );

    // Initialize ledgers
    let (ledgers, miners) = simulated::from_settings(&settings).await;
    info!("Ledgers initialized");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(
            settings.metrics.host.clone(),
            settings.metrics.port,
        ))
    } else {
        None
    };

    // Initialize swap engine
    let engine = Arc::new(SwapEngine::new(
        ActorContext::new(settings.actor.name.clone(), ledgers),
        settings.engine.clone(),
    ));
    info!("Swap engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start engine housekeeping
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Swap engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let engine = engine.clone();
        let interval = settings.engine.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let health = engine.ledger_health().await;
                let mut healthy = true;
                for ledger in health.iter().filter(|l| !l.healthy) {
                    warn!("Ledger {} health check failed", ledger.name);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Swap Coordinator is running as {}", settings.actor.name);
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!(
            "Metrics: http://{}:{}/metrics",
            settings.metrics.host, settings.metrics.port
        );
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }
    for miner in miners {
        miner.abort();
    }

    info!("Swap Coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
