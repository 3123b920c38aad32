use std::io;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::{http::StatusCode, Json};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

use purchase_common::ingest::{stream_ingest, IngestError, IngestSummary};
use purchase_common::metrics::INGESTED_RECORDS;
use purchase_common::retry::RetryError;
use purchase_common::store::{PurchaseStore, StoreError};

use super::app::{AppState, ErrorResponse};

/// Name of the multipart field carrying the NDJSON upload.
const FILE_FIELD: &str = "file";

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct IngestResponse {
    pub created: u64,
    pub updated: u64,
    pub total: u64,
}

impl From<IngestSummary> for IngestResponse {
    fn from(summary: IngestSummary) -> Self {
        Self {
            created: summary.created,
            updated: summary.updated,
            total: summary.total,
        }
    }
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error: impl ToString) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Stream the `file` part of a multipart upload into the store, one upsert per record.
///
/// The upload is never held in memory as a whole. Records before a failing line stay
/// stored; the error names the line that stopped the ingest.
pub async fn post<S: PurchaseStore>(
    State(state): State<AppState<S>>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, HandlerError> {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(FILE_FIELD) => break field,
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "missing multipart field \"file\"",
                ))
            }
            Err(e) => return Err(error_response(StatusCode::BAD_REQUEST, e)),
        }
    };

    let reader = Box::pin(StreamReader::new(
        field.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    ));

    let start_time = Instant::now();
    let store = &state.store;
    let retry_policy = &state.retry_policy;
    let cancel = &state.cancel;

    let result = stream_ingest(reader, |input| async move {
        let outcome = retry_policy
            .run(cancel, || store.upsert(&input))
            .await?;

        let label = if outcome.is_created() { "created" } else { "updated" };
        metrics::counter!(INGESTED_RECORDS, &[("outcome", label)]).increment(1);

        Ok::<_, RetryError<StoreError>>(outcome)
    })
    .await;

    match result {
        Ok(summary) => {
            info!(
                created = summary.created,
                updated = summary.updated,
                total = summary.total,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "ingested upload"
            );
            Ok(Json(summary.into()))
        }
        Err(e) => Err(ingest_error(e)),
    }
}

fn ingest_error(e: IngestError<RetryError<StoreError>>) -> HandlerError {
    match e {
        IngestError::Decode(_) | IngestError::Io { .. } => {
            warn!("rejected upload: {}", e);
            error_response(StatusCode::BAD_REQUEST, e)
        }
        IngestError::Record { ref error, .. } if error.is_cancelled() => {
            warn!("ingest interrupted by shutdown: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        IngestError::Record { .. } => {
            error!("failed to store upload: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
