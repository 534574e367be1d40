use anyhow::Result;
use chainpool_core::{config::AppConfig, ChainSet};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, time::Duration};
use tokio::{signal, time::interval};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Graceful shutdown timeout in seconds.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Interval between pool summary log lines.
const SUMMARY_INTERVAL_SECS: u64 = 60;

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG` wins over `logging.level` when set.
fn init_logging(config: &AppConfig) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env_filter) if env_filter == "debug" => {
            EnvFilter::new("warn,chainpool_core=debug,chainpool_node=debug")
        }
        Ok(env_filter) if env_filter == "trace" => {
            EnvFilter::new("warn,chainpool_core=trace,chainpool_node=trace")
        }
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new("warn,chainpool_core=info,chainpool_node=info")),
        Err(_) => {
            let level = &config.logging.level;
            EnvFilter::try_new(format!("warn,chainpool_core={level},chainpool_node={level}"))
                .unwrap_or_else(|_| EnvFilter::new("warn,chainpool_core=info,chainpool_node=info"))
        }
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

/// Installs the Prometheus recorder and its scrape listener.
///
/// Must run before any pool is built so every metric lands in this recorder.
fn init_metrics(config: &AppConfig) -> Result<()> {
    if !config.metrics.enabled {
        info!("Metrics export disabled");
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.prometheus_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {e}"))?;
    info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

fn log_summaries(chain_set: &ChainSet) {
    for pool in chain_set.pools() {
        let (live, best_head) = pool.live_summary();
        let states = pool.node_states();
        if live == 0 {
            warn!(chain_id = pool.chain_id(), nodes = ?states, "no live nodes");
        } else {
            info!(
                chain_id = pool.chain_id(),
                live_nodes = live,
                total_nodes = pool.len(),
                best_head = best_head,
                nodes = ?states,
                "pool summary"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration loading failed: {e}"))?;

    init_logging(&config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    info!(environment = %config.environment, "Starting chainpool node");
    debug!(
        chains = config.chains.len(),
        log_format = %config.logging.format,
        metrics_enabled = config.metrics.enabled,
        "Configuration loaded"
    );

    init_metrics(&config)?;

    let chain_set = ChainSet::with_http_transports(&config.chains)?;
    chain_set.start_all()?;

    let mut summary_ticker = interval(Duration::from_secs(SUMMARY_INTERVAL_SECS));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = summary_ticker.tick() => log_summaries(&chain_set),
        }
    }

    if tokio::time::timeout(
        Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS),
        chain_set.stop_all(),
    )
    .await
    .is_err()
    {
        error!(
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT_SECS,
            "Graceful shutdown timed out"
        );
    }

    info!("Chainpool node shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(
                error = %e,
                "Failed to install Ctrl+C handler"
            );
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to install signal handler"
                );

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "Shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
