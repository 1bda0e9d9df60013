use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use quasar_common::telemetry::init_tracing;
use quasar_meta::{DocumentStore, EtcdMetaStore};
use quasar_worker::api::{router, WorkerState};
use quasar_worker::args::Args;
use quasar_worker::circuit_breaker::sample_loop;
use quasar_worker::heartbeat::{heartbeat_loop, register_node};
use quasar_worker::metrics::SharedMetrics;
use quasar_worker::{CircuitBreaker, ConnectorLoader, ModelCache, WorkerExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let tracer = init_tracing(
        "quasar-worker",
        &args.log_filter,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    tracing::info!(node_id=%args.node_id, "quasar-worker starting");

    let store = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
    let docs = DocumentStore::with_root(Arc::new(store), &args.meta_root);
    tracing::info!(endpoint=%args.etcd_endpoint, "connected to etcd");

    let breaker = Arc::new(CircuitBreaker::new(
        args.memory_threshold_percent,
        args.gpu_memory_threshold_percent,
    ));
    let executor = WorkerExecutor::new(
        args.executor_settings(),
        Arc::new(ModelCache::new()),
        breaker.clone(),
        Arc::new(ConnectorLoader),
        Arc::new(SharedMetrics::default()),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(sample_loop(
        breaker,
        Duration::from_millis(args.breaker_sample_interval_ms),
        shutdown.clone(),
    ));

    let node = args.node_info();
    register_node(&docs, &node, args.heartbeat_ttl_ms).await?;
    let heartbeat = tokio::spawn(heartbeat_loop(
        docs,
        node,
        args.heartbeat_ttl_ms,
        args.heartbeat_interval_ms,
        shutdown.clone(),
    ));

    let app = router(Arc::new(WorkerState { executor }));
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen=%args.listen, "worker api listening");

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = heartbeat.await;
    if let Some(provider) = tracer {
        let _ = provider.shutdown();
    }
    Ok(())
}
