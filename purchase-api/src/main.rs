use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use purchase_common::metrics::setup_metrics_recorder;
use purchase_common::pgstore::PgPurchaseStore;
use purchase_common::shutdown::{drain_token, install_signal_handler};

mod config;
mod handlers;

async fn listen(app: Router, bind: String, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PgPurchaseStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize purchase store");
    if config.run_migrations {
        store.migrate().await.expect("failed to run migrations");
    }

    let shutdown = install_signal_handler();
    let shutdown_timeout: Duration = config.shutdown_timeout.0;
    // Storage retries of in-flight uploads give up once the shutdown timeout has elapsed.
    let drain = drain_token(&shutdown, shutdown_timeout);

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");
    let state = handlers::AppState::new(store, config.retry_policy.policy(), drain.clone());
    let app = handlers::app(state, Some(recorder_handle), config.max_upload_bytes);

    let mut server = tokio::spawn(listen(app, config.bind(), shutdown.clone()));

    let result = tokio::select! {
        result = &mut server => result,
        _ = shutdown.cancelled() => {
            // A little slack past the drain token so cancelled requests can still respond.
            match tokio::time::timeout(shutdown_timeout + Duration::from_secs(1), &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("in-flight requests did not finish in time, exiting");
                    server.abort();
                    return;
                }
            }
        }
    };

    match result {
        Ok(Ok(_)) => info!("purchase-api stopped"),
        Ok(Err(e)) => error!("failed to start purchase-api http server, {}", e),
        Err(e) => error!("purchase-api http server task failed, {}", e),
    }
    drain.cancel();
}
