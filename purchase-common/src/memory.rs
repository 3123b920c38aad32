//! # MemoryPurchaseStore
//!
//! An in-process `PurchaseStore` for tests that should not need a database.
//!
//! Without row locks to lean on, a claim is emulated by a set of leased purchase ids: a
//! claimed id is skipped by other claimers until its batch commits or is dropped. Writes made
//! through a batch are buffered and applied in one step on commit, so a dropped batch leaves
//! nothing behind. Upserts of a leased purchase wait for the lease to end, as they would on a
//! locked row.
//!
//! Failures can be injected per operation to exercise retry paths, and a claimed batch can be
//! made to lose its connection, failing every write until it is dropped.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::purchase::{PlayerLoyalty, Purchase, PurchaseInput, UpsertOutcome};
use crate::store::{ClaimedBatch, PurchaseStore, StoreError, StoreResult};

/// Store operations failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upsert,
    Claim,
    AwardLoyalty,
    MarkProcessed,
    Commit,
}

impl Operation {
    fn command(&self) -> &'static str {
        match self {
            Operation::Upsert => "INSERT",
            Operation::Claim => "SELECT",
            Operation::AwardLoyalty => "INSERT",
            Operation::MarkProcessed => "UPDATE",
            Operation::Commit => "COMMIT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    /// Fail this many more calls with a retryable error.
    Transient(u32),
    /// Fail every call with an error that is not retryable.
    Permanent,
}

#[derive(Default)]
struct State {
    next_id: i64,
    purchases: BTreeMap<i64, Purchase>,
    ids: HashMap<String, i64>,
    /// Player each purchase's loyalty points were credited to.
    credited: HashMap<i64, String>,
    loyalty: HashMap<String, PlayerLoyalty>,
    leased: HashSet<i64>,
    failures: HashMap<Operation, Failure>,
    calls: HashMap<Operation, u32>,
    /// Non-empty claims still to hand out with a lost connection.
    broken_batches: u32,
}

impl State {
    fn call(&mut self, operation: Operation) -> StoreResult<()> {
        *self.calls.entry(operation).or_default() += 1;

        match self.failures.get_mut(&operation) {
            Some(Failure::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::ConnectionError {
                    error: sqlx::Error::PoolTimedOut,
                })
            }
            Some(Failure::Permanent) => Err(StoreError::QueryError {
                command: operation.command().to_owned(),
                error: sqlx::Error::Configuration("injected failure".into()),
            }),
            _ => Ok(()),
        }
    }

    /// The changes to player totals crediting `points` for `purchase_id` would make.
    fn credit_deltas(&self, purchase_id: i64, points: i64) -> StoreResult<Vec<(String, i64)>> {
        let purchase = self
            .purchases
            .get(&purchase_id)
            .ok_or(StoreError::NotFound(purchase_id))?;

        Ok(match self.credited.get(&purchase_id) {
            Some(previous) if *previous != purchase.player_id => vec![
                (previous.clone(), -purchase.loyalty_points),
                (purchase.player_id.clone(), points),
            ],
            _ => vec![(purchase.player_id.clone(), points - purchase.loyalty_points)],
        })
    }

    fn write_purchase(
        &mut self,
        input: &PurchaseInput,
        existing: Option<i64>,
    ) -> StoreResult<UpsertOutcome> {
        let now = Utc::now();

        if let Some(id) = existing {
            let purchase = self.purchases.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            purchase.player_id = input.player_id.clone();
            purchase.player_username = input.player_username.clone();
            purchase.game_title = input.game_title.clone();
            purchase.item_type = input.item_type;
            purchase.genre = input.genre.clone();
            purchase.platform = input.platform;
            purchase.amount_cents = input.amount_cents;
            purchase.currency = input.currency.clone();
            purchase.player_level = input.player_level;
            purchase.created_at = input.created_at;
            purchase.processed = false;
            purchase.updated_at = now;
            return Ok(UpsertOutcome::Updated);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.ids.insert(input.transaction_id.clone(), id);
        self.purchases.insert(
            id,
            Purchase {
                id,
                transaction_id: input.transaction_id.clone(),
                player_id: input.player_id.clone(),
                player_username: input.player_username.clone(),
                game_title: input.game_title.clone(),
                item_type: input.item_type,
                genre: input.genre.clone(),
                platform: input.platform,
                amount_cents: input.amount_cents,
                currency: input.currency.clone(),
                player_level: input.player_level,
                created_at: input.created_at,
                processed: false,
                loyalty_points: 0,
                inserted_at: now,
                updated_at: now,
            },
        );

        Ok(UpsertOutcome::Created)
    }

    fn apply_credit(&mut self, purchase_id: i64, points: i64) -> StoreResult<()> {
        let now = Utc::now();

        for (player_id, delta) in self.credit_deltas(purchase_id, points)? {
            let loyalty = self
                .loyalty
                .entry(player_id.clone())
                .or_insert_with(|| PlayerLoyalty {
                    player_id: player_id.clone(),
                    loyalty_points: 0,
                    updated_at: now,
                });
            loyalty.loyalty_points += delta;
            loyalty.updated_at = now;
        }

        if let Some(purchase) = self.purchases.get_mut(&purchase_id) {
            purchase.loyalty_points = points;
            purchase.updated_at = now;
            self.credited.insert(purchase_id, purchase.player_id.clone());
        }

        Ok(())
    }
}

/// An in-memory purchase store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryPurchaseStore {
    state: Arc<Mutex<State>>,
    released: Arc<Notify>,
}

impl MemoryPurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `operation` with a retryable error.
    pub fn fail_transiently(&self, operation: Operation, times: u32) {
        self.state()
            .failures
            .insert(operation, Failure::Transient(times));
    }

    /// Fail every later call of `operation` with an error that is not retryable.
    pub fn fail_permanently(&self, operation: Operation) {
        self.state().failures.insert(operation, Failure::Permanent);
    }

    /// Lose the connection of the next `batches` non-empty claims: every write and the commit
    /// of such a batch fail with a retryable error, however often they are retried.
    pub fn break_next_batches(&self, batches: u32) {
        self.state().broken_batches = batches;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.broken_batches = 0;
    }

    /// How many times `operation` was called, failed calls included.
    pub fn calls(&self, operation: Operation) -> u32 {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Every stored purchase, in id order.
    pub fn purchases(&self) -> Vec<Purchase> {
        self.state().purchases.values().cloned().collect()
    }

    /// Number of purchases currently leased by a batch.
    pub fn leased(&self) -> usize {
        self.state().leased.len()
    }
}

#[async_trait]
impl PurchaseStore for MemoryPurchaseStore {
    type Batch = MemoryClaimedBatch;

    async fn upsert(&self, input: &PurchaseInput) -> StoreResult<UpsertOutcome> {
        loop {
            let released = self.released.notified();

            let outcome = {
                let mut guard = self.state();
                let state = &mut *guard;
                state.call(Operation::Upsert)?;

                match state.ids.get(&input.transaction_id).copied() {
                    Some(id) if state.leased.contains(&id) => None,
                    existing => Some(state.write_purchase(input, existing)?),
                }
            };

            match outcome {
                Some(outcome) => return Ok(outcome),
                None => released.await,
            }
        }
    }

    async fn claim_batch(&self, limit: usize) -> StoreResult<MemoryClaimedBatch> {
        let mut state = self.state();
        state.call(Operation::Claim)?;

        let purchases: Vec<Purchase> = state
            .purchases
            .values()
            .filter(|purchase| !purchase.processed && !state.leased.contains(&purchase.id))
            .take(limit)
            .cloned()
            .collect();

        state.leased.extend(purchases.iter().map(|purchase| purchase.id));

        let broken = !purchases.is_empty() && state.broken_batches > 0;
        if broken {
            state.broken_batches -= 1;
        }

        Ok(MemoryClaimedBatch {
            store: self.clone(),
            purchases,
            pending: Mutex::new(Pending::default()),
            broken,
        })
    }

    async fn mark_processed(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state();
        state.call(Operation::MarkProcessed)?;

        let purchase = state.purchases.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        purchase.processed = true;
        purchase.updated_at = Utc::now();
        Ok(())
    }

    async fn list_after_id(&self, after_id: i64, limit: i64) -> StoreResult<Vec<Purchase>> {
        let limit = usize::try_from(limit).unwrap_or(0);

        Ok(self
            .state()
            .purchases
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(_, purchase)| purchase.clone())
            .collect())
    }

    async fn player_loyalty(&self, player_id: &str) -> StoreResult<Option<PlayerLoyalty>> {
        Ok(self.state().loyalty.get(player_id).cloned())
    }
}

#[derive(Default)]
struct Pending {
    /// Points to credit, by purchase id, in the order they were awarded.
    credits: Vec<(i64, i64)>,
    processed: HashSet<i64>,
}

/// Purchases leased from a `MemoryPurchaseStore`.
pub struct MemoryClaimedBatch {
    store: MemoryPurchaseStore,
    purchases: Vec<Purchase>,
    pending: Mutex<Pending>,
    /// Set when the batch was claimed over a connection that is gone.
    broken: bool,
}

impl MemoryClaimedBatch {
    fn contains(&self, id: i64) -> bool {
        self.purchases.iter().any(|purchase| purchase.id == id)
    }

    fn connection(&self) -> StoreResult<()> {
        if self.broken {
            return Err(StoreError::ConnectionError {
                error: sqlx::Error::Io(std::io::ErrorKind::BrokenPipe.into()),
            });
        }
        Ok(())
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ClaimedBatch for MemoryClaimedBatch {
    fn purchases(&self) -> &[Purchase] {
        &self.purchases
    }

    async fn award_loyalty(&self, purchase: &Purchase, points: i64) -> StoreResult<PlayerLoyalty> {
        if !self.contains(purchase.id) {
            return Err(StoreError::Conflict(purchase.id));
        }

        let mut state = self.store.state();
        state.call(Operation::AwardLoyalty)?;
        self.connection()?;

        let mut pending = self.pending();
        pending.credits.retain(|(id, _)| *id != purchase.id);
        pending.credits.push((purchase.id, points));

        // Preview the player's total as this batch would commit it.
        let player_id = &state
            .purchases
            .get(&purchase.id)
            .ok_or(StoreError::NotFound(purchase.id))?
            .player_id;
        let mut total = state
            .loyalty
            .get(player_id)
            .map_or(0, |loyalty| loyalty.loyalty_points);
        for (id, points) in pending.credits.iter() {
            for (credited, delta) in state.credit_deltas(*id, *points)? {
                if credited == *player_id {
                    total += delta;
                }
            }
        }

        Ok(PlayerLoyalty {
            player_id: player_id.clone(),
            loyalty_points: total,
            updated_at: Utc::now(),
        })
    }

    async fn mark_processed(&self, id: i64) -> StoreResult<()> {
        if !self.contains(id) {
            return Err(StoreError::Conflict(id));
        }

        let mut state = self.store.state();
        state.call(Operation::MarkProcessed)?;
        self.connection()?;
        if !state.purchases.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        self.pending().processed.insert(id);
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        let mut state = self.store.state();
        state.call(Operation::Commit)?;
        self.connection()?;

        let pending = std::mem::take(&mut *self.pending());
        for (id, points) in pending.credits {
            state.apply_credit(id, points)?;
        }
        let now = Utc::now();
        for id in pending.processed {
            if let Some(purchase) = state.purchases.get_mut(&id) {
                purchase.processed = true;
                purchase.updated_at = now;
            }
        }
        drop(state);

        // The lease itself is released when `self` drops.
        Ok(())
    }
}

impl Drop for MemoryClaimedBatch {
    fn drop(&mut self) {
        let mut state = self.store.state();
        for purchase in self.purchases.iter() {
            state.leased.remove(&purchase.id);
        }
        drop(state);
        self.store.released.notify_waiters();
    }
}
