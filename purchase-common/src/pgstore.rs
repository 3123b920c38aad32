//! # PgPurchaseStore
//!
//! A `PurchaseStore` backed by PostgreSQL.
//!
//! Claims are plain row locks: `claim_batch` selects unprocessed rows `FOR UPDATE SKIP LOCKED`
//! inside a transaction that the returned batch keeps open. Concurrent claimers skip those rows
//! until the batch commits or is dropped, so a crashed worker never strands a purchase.
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::purchase::{PlayerLoyalty, Purchase, PurchaseInput, UpsertOutcome};
use crate::store::{ClaimedBatch, PurchaseStore, StoreError, StoreResult};

/// Apply the migrations under `migrations/` to the pool's database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../migrations");

/// A purchase store implemented on top of PostgreSQL tables.
#[derive(Clone)]
pub struct PgPurchaseStore {
    pool: PgPool,
}

impl PgPurchaseStore {
    /// Initialize a new PgPurchaseStore, connecting lazily to the database at `url`.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgPurchaseStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        MIGRATOR.run(&self.pool).await
    }

    /// Check that a connection can be acquired and used.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut connection = self
            .pool
            .acquire()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        connection
            .ping()
            .await
            .map_err(|error| StoreError::ConnectionError { error })
    }
}

#[async_trait]
impl PurchaseStore for PgPurchaseStore {
    type Batch = PgClaimedBatch;

    async fn upsert(&self, input: &PurchaseInput) -> StoreResult<UpsertOutcome> {
        // xmax is only zero for a tuple this statement inserted.
        let base_query = r#"
INSERT INTO purchases
    (transaction_id, player_id, player_username, game_title, item_type, genre, platform,
     amount_cents, currency, player_level, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (transaction_id) DO UPDATE
SET
    player_id = EXCLUDED.player_id,
    player_username = EXCLUDED.player_username,
    game_title = EXCLUDED.game_title,
    item_type = EXCLUDED.item_type,
    genre = EXCLUDED.genre,
    platform = EXCLUDED.platform,
    amount_cents = EXCLUDED.amount_cents,
    currency = EXCLUDED.currency,
    player_level = EXCLUDED.player_level,
    created_at = EXCLUDED.created_at,
    processed = FALSE,
    updated_at = NOW()
RETURNING
    (xmax = 0) AS created
        "#;

        let created: bool = sqlx::query_scalar(base_query)
            .bind(&input.transaction_id)
            .bind(&input.player_id)
            .bind(&input.player_username)
            .bind(&input.game_title)
            .bind(input.item_type)
            .bind(&input.genre)
            .bind(input.platform)
            .bind(input.amount_cents)
            .bind(&input.currency)
            .bind(input.player_level)
            .bind(input.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(UpsertOutcome::from_created(created))
    }

    async fn claim_batch(&self, limit: usize) -> StoreResult<PgClaimedBatch> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let base_query = r#"
SELECT
    *
FROM
    purchases
WHERE
    NOT processed
ORDER BY
    id
LIMIT $1
FOR UPDATE SKIP LOCKED
        "#;

        let purchases: Vec<Purchase> = sqlx::query_as(base_query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *txn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        debug!(claimed = purchases.len(), "claimed purchase batch");

        Ok(PgClaimedBatch {
            purchases,
            txn: Mutex::new(Some(txn)),
        })
    }

    async fn mark_processed(&self, id: i64) -> StoreResult<()> {
        mark_processed(&self.pool, id).await
    }

    async fn list_after_id(&self, after_id: i64, limit: i64) -> StoreResult<Vec<Purchase>> {
        let base_query = r#"
SELECT
    *
FROM
    purchases
WHERE
    id > $1
ORDER BY
    id
LIMIT $2
        "#;

        sqlx::query_as(base_query)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn player_loyalty(&self, player_id: &str) -> StoreResult<Option<PlayerLoyalty>> {
        sqlx::query_as("SELECT * FROM player_loyalty WHERE player_id = $1")
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

async fn mark_processed<'c, E>(executor: E, id: i64) -> StoreResult<()>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let base_query = r#"
UPDATE
    purchases
SET
    processed = TRUE,
    updated_at = NOW()
WHERE
    id = $1
    "#;

    let result = sqlx::query(base_query)
        .bind(id)
        .execute(executor)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id));
    }

    Ok(())
}

/// What a purchase has credited so far.
#[derive(sqlx::FromRow)]
struct Credit {
    player_id: String,
    loyalty_points: i64,
    credited_player_id: Option<String>,
}

/// A batch of purchases claimed within an open PostgreSQL transaction.
/// The transaction is what hides these rows from any other worker running SKIP LOCKED queries.
pub struct PgClaimedBatch {
    purchases: Vec<Purchase>,
    /// `None` once committed.
    txn: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgClaimedBatch {
    /// Run `award` inside a savepoint of the claim transaction, so that a failed statement only
    /// rolls back itself and the caller may retry.
    async fn award_in_savepoint(
        txn: &mut Transaction<'static, Postgres>,
        purchase_id: i64,
        points: i64,
    ) -> StoreResult<PlayerLoyalty> {
        let mut savepoint = Connection::begin(&mut **txn).await.map_err(|error| {
            StoreError::TransactionError {
                command: "SAVEPOINT".to_owned(),
                error,
            }
        })?;

        let credit: Credit = sqlx::query_as(
            "SELECT player_id, loyalty_points, credited_player_id FROM purchases WHERE id = $1",
        )
        .bind(purchase_id)
        .fetch_optional(&mut *savepoint)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?
        .ok_or(StoreError::NotFound(purchase_id))?;

        // A purchase moved to another player since it was last credited: take the points back.
        let delta = match credit.credited_player_id {
            Some(ref previous) if *previous != credit.player_id => {
                sqlx::query(
                    r#"
UPDATE
    player_loyalty
SET
    loyalty_points = loyalty_points - $2,
    updated_at = NOW()
WHERE
    player_id = $1
                    "#,
                )
                .bind(previous)
                .bind(credit.loyalty_points)
                .execute(&mut *savepoint)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;

                points
            }
            _ => points - credit.loyalty_points,
        };

        sqlx::query(
            r#"
UPDATE
    purchases
SET
    loyalty_points = $2,
    credited_player_id = player_id,
    updated_at = NOW()
WHERE
    id = $1
            "#,
        )
        .bind(purchase_id)
        .bind(points)
        .execute(&mut *savepoint)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        let loyalty: PlayerLoyalty = sqlx::query_as(
            r#"
INSERT INTO player_loyalty
    (player_id, loyalty_points, updated_at)
VALUES
    ($1, $2, NOW())
ON CONFLICT (player_id) DO UPDATE
SET
    loyalty_points = player_loyalty.loyalty_points + EXCLUDED.loyalty_points,
    updated_at = NOW()
RETURNING
    player_id,
    loyalty_points,
    updated_at
            "#,
        )
        .bind(&credit.player_id)
        .bind(delta)
        .fetch_one(&mut *savepoint)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        savepoint
            .commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "RELEASE SAVEPOINT".to_owned(),
                error,
            })?;

        Ok(loyalty)
    }

    fn contains(&self, id: i64) -> bool {
        self.purchases.iter().any(|purchase| purchase.id == id)
    }
}

#[async_trait]
impl ClaimedBatch for PgClaimedBatch {
    fn purchases(&self) -> &[Purchase] {
        &self.purchases
    }

    async fn award_loyalty(&self, purchase: &Purchase, points: i64) -> StoreResult<PlayerLoyalty> {
        if !self.contains(purchase.id) {
            return Err(StoreError::Conflict(purchase.id));
        }

        let mut txn_guard = self.txn.lock().await;
        let txn = txn_guard
            .as_mut()
            .ok_or(StoreError::TransactionAlreadyClosedError)?;

        Self::award_in_savepoint(txn, purchase.id, points).await
    }

    async fn mark_processed(&self, id: i64) -> StoreResult<()> {
        if !self.contains(id) {
            return Err(StoreError::Conflict(id));
        }

        let mut txn_guard = self.txn.lock().await;
        let txn = txn_guard
            .as_mut()
            .ok_or(StoreError::TransactionAlreadyClosedError)?;

        let mut savepoint = Connection::begin(&mut **txn).await.map_err(|error| {
            StoreError::TransactionError {
                command: "SAVEPOINT".to_owned(),
                error,
            }
        })?;

        mark_processed(&mut *savepoint, id).await?;

        savepoint
            .commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "RELEASE SAVEPOINT".to_owned(),
                error,
            })
    }

    async fn commit(self) -> StoreResult<()> {
        let Some(txn) = self.txn.into_inner() else {
            return Err(StoreError::TransactionAlreadyClosedError);
        };

        txn.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}
