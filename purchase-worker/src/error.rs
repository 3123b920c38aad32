use purchase_common::retry::RetryError;
use purchase_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that stop the enrichment worker pool.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to claim a batch of purchases: {0}")]
    Claim(RetryError<StoreError>),
    #[error("failed to enrich purchase {purchase_id}: {error}")]
    Enrich {
        purchase_id: i64,
        error: RetryError<StoreError>,
    },
    #[error("failed to commit an enriched batch: {0}")]
    Commit(StoreError),
    #[error("an enrichment worker task panicked: {0}")]
    TaskPanicked(String),
}

impl WorkerError {
    /// Whether the error only means the worker was told to stop.
    pub fn is_cancelled(&self) -> bool {
        match self {
            WorkerError::Claim(error) | WorkerError::Enrich { error, .. } => error.is_cancelled(),
            WorkerError::Commit(_) | WorkerError::TaskPanicked(_) => false,
        }
    }
}
