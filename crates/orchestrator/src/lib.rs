//! Orchestrator process wiring: Postgres job store, Redis Streams bus, the job
//! aggregation saga and its dispatch runtime.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use waypoint_infra::config::Settings;
use waypoint_infra::dispatch::DispatchRuntime;
use waypoint_infra::event_bus::RedisStreamsMessageBus;
use waypoint_infra::job_store::{JobStore, PostgresJobStore};
use waypoint_infra::saga::{JobAggregationSaga, register_subscriptions};

/// Run the orchestrator until `shutdown` resolves, then drain the worker loops.
pub async fn run<F>(settings: Settings, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(settings.require_database_url()?)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PostgresJobStore::new(pool));
    store
        .ensure_indexes()
        .await
        .context("failed to prepare the jobs table")?;

    let bus = Arc::new(
        RedisStreamsMessageBus::new(&settings.redis_url)
            .context("invalid Redis URL")?
            .with_pending_timeout(settings.pending_timeout),
    );

    let saga = Arc::new(JobAggregationSaga::new(store, bus.clone()));
    let mut runtime = DispatchRuntime::new(bus, settings.dispatch_config());
    register_subscriptions(&mut runtime, saga)?;

    let handle = runtime
        .start()
        .await
        .context("failed to start subscriptions")?;
    info!(
        group = %settings.consumer_group,
        consumer = %settings.consumer_name,
        workers = handle.worker_count(),
        "orchestrator running"
    );

    shutdown.await;
    info!("shutdown requested; draining workers");
    handle.shutdown().await;
    info!("orchestrator stopped");
    Ok(())
}

/// Resolves on Ctrl-C (or SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
