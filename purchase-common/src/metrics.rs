use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const ENRICHMENT_BATCHES: &str = "purchase_enrichment_batches_total";
pub const ENRICHMENT_PURCHASES: &str = "purchase_enrichment_purchases_total";
pub const ENRICHMENT_ERRORS: &str = "purchase_enrichment_errors_total";
pub const ENRICHMENT_BATCH_DURATION: &str = "purchase_enrichment_batch_duration_seconds";
pub const INGESTED_RECORDS: &str = "purchase_ingest_records_total";

/// Bind a `TcpListener` on `bind` and serve `router` until the process exits.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await
}

/// Add a `/metrics` endpoint rendering the installed Prometheus recorder to `router`, and
/// track request metrics for every route of it.
pub fn setup_metrics_routes(router: Router, handle: Option<PrometheusHandle>) -> Router {
    router
        .route(
            "/metrics",
            get(move || match handle {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global Prometheus recorder. Fails if a recorder was already installed.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()?;

    describe_metrics();

    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(ENRICHMENT_BATCHES, "Non-empty batches claimed for enrichment.");
    metrics::describe_counter!(
        ENRICHMENT_PURCHASES,
        "Purchases enriched, by outcome of their batch."
    );
    metrics::describe_counter!(ENRICHMENT_ERRORS, "Enrichment failures, by stage.");
    metrics::describe_histogram!(
        ENRICHMENT_BATCH_DURATION,
        metrics::Unit::Seconds,
        "Time from claiming a batch to committing or abandoning it."
    );
    metrics::describe_counter!(INGESTED_RECORDS, "Records ingested, by upsert outcome.");
}

/// Middleware recording `http_requests_total` and `http_requests_duration_seconds`, labelled
/// by method, matched route and status code.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    // Label by route template, so /purchases?after_id=N does not explode cardinality.
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
