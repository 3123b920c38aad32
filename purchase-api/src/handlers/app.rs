use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use purchase_common::metrics::setup_metrics_routes;
use purchase_common::retry::RetryPolicy;
use purchase_common::store::PurchaseStore;

use super::{ingest, purchases};

/// Shared by every handler.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub retry_policy: RetryPolicy,
    /// Cancelled when in-flight storage retries should give up.
    pub cancel: CancellationToken,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry_policy: self.retry_policy.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S> AppState<S> {
    pub fn new(store: S, retry_policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            store: Arc::new(store),
            retry_policy,
            cancel,
        }
    }
}

/// The body of every error response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app<S: PurchaseStore>(
    state: AppState<S>,
    metrics: Option<PrometheusHandle>,
    max_upload_bytes: usize,
) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(|| async { "ok" }))
        .route(
            "/ingest",
            routing::post(ingest::post::<S>).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/purchases", routing::get(purchases::get::<S>))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    setup_metrics_routes(router, metrics)
}

pub async fn index() -> &'static str {
    "purchase api"
}
