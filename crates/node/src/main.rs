//! Node entry point.

use std::sync::Arc;

use message_bus::InMemoryBus;
use node::config::{Config, LogFormat};
use node::{Backend, NodeInfo};
use saga::SagaRuntime;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let (stores, backend) = match &config.database_url {
        Some(url) => {
            let stores = node::postgres_stores(url)
                .await
                .expect("failed to connect to database");
            (stores, Backend::Postgres)
        }
        None => (node::in_memory_stores(), Backend::Memory),
    };

    let bus = Arc::new(InMemoryBus::new(config.bus_partitions));
    let runtime = SagaRuntime::start(bus.clone(), stores, config.saga_settings())
        .await
        .expect("failed to start saga runtime");

    let node = Arc::new(NodeInfo {
        backend,
        partitions: config.bus_partitions,
        workers_per_topic: config.workers_per_topic,
    });
    let app = node::create_app(node, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, backend = backend.as_str(), "starting node");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    runtime.shutdown().await;
    bus.close().await;
    tracing::info!("node shut down gracefully");
}
