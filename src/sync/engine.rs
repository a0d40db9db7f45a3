//! Reconciliation engine
//!
//! Pull reads every kind concurrently and degrades a failing kind to an empty
//! list. Push merges each incoming record with last-writer-wins on
//! `created_at`: a record replaces the local copy only when it is strictly
//! newer, so an equal timestamp keeps what is already stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;

use super::protocol::{MergeStats, SyncChanges, SyncSnapshot};
use crate::db::{
    Debt, EntityKind, Expense, Income, Password, Person, RecordRepository, SyncEntity,
};

/// Outcome of merging a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Written to the store
    Processed,
    /// Local copy kept
    Skipped,
    /// Undecodable, unversioned, or the store failed
    Failed,
}

impl From<MergeOutcome> for MergeStats {
    fn from(outcome: MergeOutcome) -> Self {
        let mut stats = MergeStats::default();
        match outcome {
            MergeOutcome::Processed => stats.processed = 1,
            MergeOutcome::Skipped => stats.skipped = 1,
            MergeOutcome::Failed => stats.errors = 1,
        }
        stats
    }
}

/// Per-record async locks so that concurrent pushes of the same id
/// serialize their compare-and-write.
#[derive(Clone, Default)]
struct RecordLocks {
    inner: Arc<Mutex<HashMap<(EntityKind, i64), Arc<tokio::sync::Mutex<()>>>>>,
}

struct RecordGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: (EntityKind, i64),
    locks: RecordLocks,
}

impl RecordLocks {
    async fn lock(&self, kind: EntityKind, id: i64) -> RecordGuard {
        let key = (kind, id);
        let mutex = self.inner.lock().entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;

        RecordGuard {
            guard: Some(guard),
            key,
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock();
        // Only the map still references the mutex: nobody holds or awaits it.
        if map.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.key);
        }
    }
}

/// Merges remote batches into the local store and produces snapshots
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: SqlitePool,
    locks: RecordLocks,
}

impl ReconciliationEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: RecordLocks::default(),
        }
    }

    /// Read all five kinds. A kind whose read fails comes back empty.
    pub async fn pull(&self) -> SyncSnapshot {
        let repo = RecordRepository::new(&self.pool);

        let (expenses, incomes, debts, people, passwords) = tokio::join!(
            fetch_or_empty::<Expense>(&repo),
            fetch_or_empty::<Income>(&repo),
            fetch_or_empty::<Debt>(&repo),
            fetch_or_empty::<Person>(&repo),
            fetch_or_empty::<Password>(&repo),
        );

        SyncSnapshot {
            expenses,
            incomes,
            debts,
            people,
            passwords,
        }
    }

    /// Merge every batch in `changes`. Resolves once all writes have finished.
    pub async fn merge(&self, changes: SyncChanges) -> MergeStats {
        if let Some(passwords) = &changes.passwords {
            tracing::debug!("Ignoring {} pushed password record(s)", passwords.len());
        }

        let (expenses, incomes, people, debts) = tokio::join!(
            self.merge_batch::<Expense>(changes.expenses),
            self.merge_batch::<Income>(changes.incomes),
            self.merge_batch::<Person>(changes.people),
            self.merge_batch::<Debt>(changes.debts),
        );

        let mut stats = MergeStats::default();
        for batch in [expenses, incomes, people, debts] {
            stats += batch;
        }
        stats
    }

    /// Merge one kind's batch; records are written concurrently.
    pub async fn merge_batch<T: SyncEntity>(&self, records: Option<Vec<Value>>) -> MergeStats {
        let Some(records) = records else {
            return MergeStats::default();
        };

        let outcomes = join_all(records.into_iter().map(|raw| self.merge_record::<T>(raw))).await;

        let mut stats = MergeStats::default();
        for outcome in outcomes {
            stats += MergeStats::from(outcome);
        }

        tracing::debug!(
            "Merged {}: {} processed, {} skipped, {} errors",
            T::KIND,
            stats.processed,
            stats.skipped,
            stats.errors
        );
        stats
    }

    /// Compare-and-write a single incoming record
    pub async fn merge_record<T: SyncEntity>(&self, raw: Value) -> MergeOutcome {
        if !T::KIND.accepts_remote_writes() {
            return MergeOutcome::Skipped;
        }

        let record: T = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Rejected {} record: {}", T::KIND, e);
                return MergeOutcome::Failed;
            }
        };

        let Some(incoming) = parse_logical_timestamp(record.created_at()) else {
            tracing::warn!(
                "Rejected {} record {}: unreadable created_at {:?}",
                T::KIND,
                record.id(),
                record.created_at()
            );
            return MergeOutcome::Failed;
        };

        let _guard = self.locks.lock(T::KIND, record.id()).await;
        let repo = RecordRepository::new(&self.pool);

        let local = match repo.fetch_one::<T>(record.id()).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!("Failed to read {} {}: {}", T::KIND, record.id(), e);
                return MergeOutcome::Failed;
            }
        };

        if let Some(local) = &local {
            if !incoming_wins(incoming, local.created_at()) {
                return MergeOutcome::Skipped;
            }
        }

        match repo.upsert(&record).await {
            Ok(()) => MergeOutcome::Processed,
            Err(e) => {
                tracing::warn!("Failed to write {} {}: {}", T::KIND, record.id(), e);
                MergeOutcome::Failed
            }
        }
    }
}

async fn fetch_or_empty<T: SyncEntity>(repo: &RecordRepository<'_>) -> Vec<T> {
    match repo.fetch_all::<T>().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("Failed to read {} for snapshot: {}", T::KIND, e);
            Vec::new()
        }
    }
}

/// Strictly newer wins. An unreadable local timestamp counts as oldest.
fn incoming_wins(incoming: DateTime<Utc>, local_created_at: &str) -> bool {
    match parse_logical_timestamp(local_created_at) {
        Some(local) => incoming > local,
        None => true,
    }
}

/// Parse a `created_at` value as an instant.
///
/// Accepts RFC 3339 and SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC).
pub fn parse_logical_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
