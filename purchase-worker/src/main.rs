//! Run the enrichment worker pool against the purchases database.
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use purchase_common::health::HealthRegistry;
use purchase_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use purchase_common::pgstore::PgPurchaseStore;
use purchase_common::shutdown::install_signal_handler;
use purchase_worker::config::Config;
use purchase_worker::error::WorkerError;
use purchase_worker::worker::EnrichmentPool;

pub async fn index() -> &'static str {
    "purchase enrichment worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = PgPurchaseStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize purchase store");
    if config.run_migrations {
        store.migrate().await.expect("failed to run migrations");
    }

    let liveness = HealthRegistry::new("liveness");
    let shutdown = install_signal_handler();

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get({
                let liveness = liveness.clone();
                move || std::future::ready(liveness.get_status())
            }),
        );
    let router = setup_metrics_routes(router, Some(recorder_handle));

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let pool = EnrichmentPool::new(store, config.pool_config(), liveness);
    pool.run(shutdown).await?;

    info!("purchase-worker stopped");
    Ok(())
}
