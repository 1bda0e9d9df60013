use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use quasar_common::telemetry::init_tracing;
use quasar_coordinator::args::Args;
use quasar_coordinator::metrics::SharedMetrics;
use quasar_coordinator::{
    reconcile_loop, router, AppState, DeploymentCoordinator, HttpTransport, MetaTopology,
};
use quasar_meta::{DocumentStore, EtcdMetaStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let tracer = init_tracing(
        "quasar-coordinator",
        &args.log_filter,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    let settings = args.settings()?;
    tracing::info!(node_id=%settings.node_id, "quasar-coordinator starting");

    let store = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
    let docs = DocumentStore::with_root(Arc::new(store), &args.meta_root);
    tracing::info!(endpoint=%args.etcd_endpoint, root=%args.meta_root, "connected to etcd");

    let topology = Arc::new(MetaTopology::new(settings.node_id.clone(), docs.clone()));
    let transport = Arc::new(HttpTransport::new(topology.clone(), settings.dispatch_timeout)?);
    let coordinator = DeploymentCoordinator::new(
        settings,
        docs,
        topology,
        transport,
        Arc::new(SharedMetrics::default()),
    );

    let shutdown = CancellationToken::new();
    let watcher = tokio::spawn(coordinator.clone().watch_nodes(shutdown.clone()));
    let reconciler = tokio::spawn(reconcile_loop(coordinator.clone(), shutdown.clone()));

    let app = router(Arc::new(AppState::new(coordinator)));
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen=%args.listen, "coordinator api listening");

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = watcher.await;
    let _ = reconciler.await;
    if let Some(provider) = tracer {
        let _ = provider.shutdown();
    }
    Ok(())
}
