//! # Store
//!
//! The storage contract the ingest api and the enrichment worker are written against.
use async_trait::async_trait;
use thiserror::Error;

use crate::purchase::{PlayerLoyalty, Purchase, PurchaseInput, UpsertOutcome};
use crate::retry::Retryable;

/// Enumeration of storage errors.
/// Errors that can originate from sqlx are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("transaction was already closed")]
    TransactionAlreadyClosedError,
    #[error("purchase {0} not found")]
    NotFound(i64),
    #[error("purchase {0} is not part of this claim")]
    Conflict(i64),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// SQLSTATE codes worth another attempt: the failure says nothing about the statement itself.
const RETRYABLE_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

fn is_retryable_sqlx_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db_error) => match db_error.code() {
            // Class 08: connection exceptions.
            Some(code) => code.starts_with("08") || RETRYABLE_SQLSTATES.contains(&&*code),
            None => false,
        },
        _ => false,
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::PoolCreationError { error }
            | StoreError::ConnectionError { error }
            | StoreError::QueryError { error, .. }
            | StoreError::TransactionError { error, .. } => is_retryable_sqlx_error(error),
            StoreError::TransactionAlreadyClosedError
            | StoreError::NotFound(_)
            | StoreError::Conflict(_) => false,
        }
    }
}

/// Durable storage for purchases and player loyalty.
#[async_trait]
pub trait PurchaseStore: Send + Sync + 'static {
    /// A set of purchases claimed for enrichment. Nobody else can claim them until the
    /// batch is committed or dropped.
    type Batch: ClaimedBatch;

    /// Insert a purchase, or overwrite the one with the same transaction id and mark it as
    /// needing enrichment again.
    async fn upsert(&self, input: &PurchaseInput) -> StoreResult<UpsertOutcome>;

    /// Claim up to `limit` unprocessed purchases, oldest first, skipping any already claimed.
    async fn claim_batch(&self, limit: usize) -> StoreResult<Self::Batch>;

    /// Mark a single purchase as processed outside of any claim.
    async fn mark_processed(&self, id: i64) -> StoreResult<()>;

    /// Purchases with an id strictly greater than `after_id`, ascending, at most `limit`.
    async fn list_after_id(&self, after_id: i64, limit: i64) -> StoreResult<Vec<Purchase>>;

    async fn player_loyalty(&self, player_id: &str) -> StoreResult<Option<PlayerLoyalty>>;
}

/// Purchases claimed by one worker.
///
/// Writes made through a batch become visible together when it is committed. Dropping a
/// batch without committing releases the claim and discards its writes.
#[async_trait]
pub trait ClaimedBatch: Send + Sync + 'static {
    fn purchases(&self) -> &[Purchase];

    fn is_empty(&self) -> bool {
        self.purchases().is_empty()
    }

    /// Credit the purchase's player so that this purchase has contributed exactly `points`.
    /// Only the difference from what the purchase already contributed is applied.
    async fn award_loyalty(&self, purchase: &Purchase, points: i64) -> StoreResult<PlayerLoyalty>;

    /// Mark a claimed purchase as processed. Fails with `Conflict` for ids outside this batch
    /// and `NotFound` for ids that do not exist.
    async fn mark_processed(&self, id: i64) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!StoreError::NotFound(1).is_retryable());
        assert!(!StoreError::TransactionAlreadyClosedError.is_retryable());
        assert!(!StoreError::Conflict(1).is_retryable());
    }

    #[test]
    fn test_connection_failures_are_retryable() {
        assert!(StoreError::ConnectionError {
            error: sqlx::Error::PoolTimedOut
        }
        .is_retryable());
        assert!(StoreError::QueryError {
            command: "SELECT".to_owned(),
            error: sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        }
        .is_retryable());
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        assert!(!StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error: sqlx::Error::RowNotFound,
        }
        .is_retryable());
    }
}
