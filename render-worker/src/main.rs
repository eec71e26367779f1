//! Standalone background-loop process: queue manager, worker monitor and
//! webhook dispatcher against a shared Redis store, for deployments that
//! split the HTTP api from the workers.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::WrapErr;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use render_common::health::LivenessRegistry;
use render_common::metrics::setup_metrics_routes;
use render_common::store::{JobStore, RedisJobStore};
use render_worker::config::{Config, StoreBackend};
use render_worker::external::WorkerRouter;
use render_worker::monitor::WorkerMonitor;
use render_worker::scheduler::QueueManager;
use render_worker::webhook::WebhookDispatcher;

async fn listen(
    router: Router,
    bind: String,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            drop(shutdown.wait_for(|stop| *stop).await);
        })
        .await?;

    Ok(())
}

/// Resolve on ctrl-c or SIGTERM and flip the cooperative shutdown flag so
/// every loop exits at its next tick boundary.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install the ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install the SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, stopping background loops");
    if shutdown.send(true).is_err() {
        warn!("no background loops were listening for shutdown");
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    if config.store.backend != StoreBackend::DurableKv {
        eyre::bail!("the standalone worker requires STORE_BACKEND=durable-kv");
    }

    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::connect(
            &config.store.redis_url,
            &config.store.key_prefix,
            config.store.max_workers,
            config.store.job_ttl_secs,
        )
        .await
        .wrap_err("failed to initialize the redis job store")?,
    );

    let workers = Arc::new(WorkerRouter::from_config(&config.dispatch));
    let wake = Arc::new(Notify::new());
    let liveness = LivenessRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    let (dispatcher, webhooks) = WebhookDispatcher::new(Arc::clone(&store), &config.webhook);
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let queue_manager = QueueManager::new(
        Arc::clone(&store),
        Arc::clone(&workers),
        webhooks.clone(),
        Arc::clone(&wake),
        &config.queue,
        config.store.max_workers,
        liveness.register("queue-manager", chrono::Duration::seconds(60)),
    );
    let queue_shutdown = shutdown_rx.clone();
    let queue_handle = tokio::spawn(async move { queue_manager.run(queue_shutdown).await });

    let monitor = WorkerMonitor::new(
        store,
        workers,
        webhooks,
        wake,
        &config.monitor,
        config.store.job_ttl_secs,
        config.webhook.max_attempts,
        liveness.register("monitor", chrono::Duration::seconds(60)),
    );
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move { monitor.run(monitor_shutdown).await });

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.status())));
    let router = setup_metrics_routes(router);

    let bind = config.bind();
    info!("render orchestrator worker listening on {}", bind);
    if let Err(err) = listen(router, bind, shutdown_rx).await {
        error!("failed to serve the render-worker health endpoints: {}", err);
    }

    // The loops exit at their next tick boundary once the flag flips.
    for handle in [dispatcher_handle, queue_handle, monitor_handle] {
        if let Err(err) = handle.await {
            error!("background task failed to shut down cleanly: {}", err);
        }
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "render orchestrator worker"
}
