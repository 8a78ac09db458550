//! Reconciliation state store.
//!
//! Single owner of every `ReplicationRecord`. Mutations happen under a
//! synchronous lock that is never held across an await; each write is then
//! persisted through a `RecordRepository`. Rows carry a version so a late
//! write can never overwrite a newer one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::{
    DestinationEntry, EntryStatus, Outcome, ReplicationRecord, SourcePosition, TransitionError,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("no replication record for position {0}")]
    UnknownRecord(String),

    #[error("position {position} has no entry for account {account}")]
    UnknownDestination { position: String, account: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// A persisted record and, if it has been archived, when.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: ReplicationRecord,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Durable storage behind the store.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Write the record row and every entry atomically.
    async fn save_record(&self, record: &ReplicationRecord) -> Result<(), StoreError>;

    /// Upsert one entry; ignored if the stored version is not older.
    async fn save_entry(
        &self,
        source_position_id: &str,
        entry: &DestinationEntry,
    ) -> Result<(), StoreError>;

    async fn load(&self, include_archived: bool) -> Result<Vec<StoredRecord>, StoreError>;

    async fn archive(&self, source_position_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// An in-transit entry that has gone quiet for too long.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleEntry {
    pub source_position_id: String,
    pub account_id: String,
    pub status: EntryStatus,
    pub idle_for: Duration,
    /// Rehydrated and waiting for manual resolution
    pub held: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub pending: usize,
    pub open: usize,
    pub close_pending: usize,
    pub closed: usize,
    pub failed: usize,
    pub held: usize,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, ReplicationRecord>,
    /// Positions whose last write did not reach storage
    dirty: BTreeSet<String>,
}

pub struct ReplicationStore {
    inner: Mutex<Inner>,
    repo: Arc<dyn RecordRepository>,
}

impl ReplicationStore {
    pub fn new(repo: Arc<dyn RecordRepository>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            repo,
        }
    }

    /// Load live records from storage.
    ///
    /// Entries found mid-flight (`PENDING`, `CLOSE_PENDING`) are held: their
    /// remote state is unknown, so they are never resumed automatically.
    pub async fn rehydrate(repo: Arc<dyn RecordRepository>) -> Result<Self, StoreError> {
        let stored = repo.load(false).await?;
        let mut records = BTreeMap::new();
        let mut held = 0usize;

        for StoredRecord { mut record, .. } in stored {
            for entry in record.entries.values_mut() {
                if entry.status.is_in_transit() {
                    entry.held = true;
                    held += 1;
                }
            }
            records.insert(record.source_position_id.clone(), record);
        }

        info!(records = records.len(), held = held, "Replication store rehydrated");

        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                dirty: BTreeSet::new(),
            }),
            repo,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a record with every destination `PENDING`, unless one already
    /// exists for this position, in which case it is returned unchanged.
    ///
    /// The flag is true when a new record was created.
    pub async fn begin_replication(
        &self,
        source: &SourcePosition,
        account_ids: &[String],
    ) -> (ReplicationRecord, bool) {
        let created = {
            let mut inner = self.lock();
            if let Some(existing) = inner.records.get(&source.position_id) {
                return (existing.clone(), false);
            }
            let record = ReplicationRecord::new(source.clone(), account_ids, Utc::now());
            inner
                .records
                .insert(record.source_position_id.clone(), record.clone());
            record
        };

        debug!(
            position = %created.source_position_id,
            destinations = created.entries.len(),
            "Replication record created"
        );
        self.persist_record(&created).await;
        (created, true)
    }

    /// Refresh the last observed source state of a record.
    pub async fn update_source(&self, source: &SourcePosition) -> Result<(), StoreError> {
        let record = {
            let mut inner = self.lock();
            let record = inner
                .records
                .get_mut(&source.position_id)
                .ok_or_else(|| StoreError::UnknownRecord(source.position_id.clone()))?;
            record.source = source.clone();
            record.clone()
        };
        self.persist_record(&record).await;
        Ok(())
    }

    /// Take exclusive ownership of an entry for one operation.
    ///
    /// Succeeds only when the entry is in `expected`, not already claimed and
    /// not held. The returned copy is the state at claim time.
    pub fn claim(
        &self,
        source_position_id: &str,
        account_id: &str,
        expected: EntryStatus,
    ) -> Option<DestinationEntry> {
        let mut inner = self.lock();
        let entry = inner
            .records
            .get_mut(source_position_id)?
            .entries
            .get_mut(account_id)?;

        if entry.status != expected || entry.in_flight || entry.held {
            return None;
        }
        entry.in_flight = true;
        Some(entry.clone())
    }

    pub fn release(&self, source_position_id: &str, account_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner
            .records
            .get_mut(source_position_id)
            .and_then(|r| r.entries.get_mut(account_id))
        {
            entry.in_flight = false;
        }
    }

    /// Release the claim and park the entry until someone resolves it.
    pub fn hold(&self, source_position_id: &str, account_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner
            .records
            .get_mut(source_position_id)
            .and_then(|r| r.entries.get_mut(account_id))
        {
            entry.in_flight = false;
            entry.held = true;
        }
    }

    /// Transition one destination entry and persist it.
    ///
    /// `attempts` is the number of remote calls that led to this outcome.
    /// Terminal entries are immutable; anything off the transition graph is
    /// rejected without touching the entry.
    pub async fn record_outcome(
        &self,
        source_position_id: &str,
        account_id: &str,
        outcome: Outcome,
        attempts: u32,
    ) -> Result<DestinationEntry, StoreError> {
        let entry = {
            let mut inner = self.lock();
            let entry = entry_mut(&mut inner, source_position_id, account_id)?;
            let now = Utc::now();

            // Validate before counting attempts so a rejected outcome leaves
            // the entry untouched.
            let mut next = entry.clone();
            next.note_attempts(attempts, now);
            next.apply(&outcome, now)?;
            *entry = next;
            entry.clone()
        };

        debug!(
            position = %source_position_id,
            account = %account_id,
            status = %entry.status,
            "Replication entry updated"
        );
        self.persist_entry(source_position_id, &entry).await;
        Ok(entry)
    }

    /// Count attempts that did not change the entry's status.
    pub async fn note_attempts(
        &self,
        source_position_id: &str,
        account_id: &str,
        attempts: u32,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        if attempts == 0 && error.is_none() {
            return Ok(());
        }
        let entry = {
            let mut inner = self.lock();
            let entry = entry_mut(&mut inner, source_position_id, account_id)?;
            let now = Utc::now();
            entry.note_attempts(attempts, now);
            if error.is_some() {
                entry.last_error = error;
                entry.touch(now);
            }
            entry.clone()
        };
        self.persist_entry(source_position_id, &entry).await;
        Ok(())
    }

    /// Remember the stop/take-profit now set on the destination order.
    pub async fn mark_applied_protection(
        &self,
        source_position_id: &str,
        account_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let entry = {
            let mut inner = self.lock();
            let entry = entry_mut(&mut inner, source_position_id, account_id)?;
            entry.applied_stop_loss = stop_loss;
            entry.applied_take_profit = take_profit;
            entry.last_error = None;
            entry.touch(Utc::now());
            entry.clone()
        };
        self.persist_entry(source_position_id, &entry).await;
        Ok(())
    }

    pub fn get(&self, source_position_id: &str) -> Option<ReplicationRecord> {
        self.lock().records.get(source_position_id).cloned()
    }

    /// Consistent copy of every live record.
    pub fn snapshot(&self) -> Vec<ReplicationRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// In-transit entries idle past `threshold` that have not been reported
    /// yet. Each entry is reported once per stay in its current state.
    pub fn sweep_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<StaleEntry> {
        let mut inner = self.lock();
        let mut stale = Vec::new();

        for record in inner.records.values_mut() {
            for entry in record.entries.values_mut() {
                if !entry.status.is_in_transit() || entry.stale_warned {
                    continue;
                }
                let idle_for = now - entry.idle_since();
                if idle_for < threshold {
                    continue;
                }
                entry.stale_warned = true;
                stale.push(StaleEntry {
                    source_position_id: record.source_position_id.clone(),
                    account_id: entry.account_id.clone(),
                    status: entry.status,
                    idle_for,
                    held: entry.held,
                });
            }
        }

        stale
    }

    /// Drop a fully terminal record from the live set.
    ///
    /// The record stays live and dirty until both the final state and the
    /// archive mark have reached storage.
    pub async fn archive(&self, source_position_id: &str) -> Result<(), StoreError> {
        let record = {
            let inner = self.lock();
            match inner.records.get(source_position_id) {
                None => return Err(StoreError::UnknownRecord(source_position_id.to_string())),
                Some(r) if !r.all_terminal() => return Ok(()),
                Some(r) => r.clone(),
            }
        };

        // Final state first so the archived row is complete
        let written = match self.repo.save_record(&record).await {
            Ok(()) => self.repo.archive(source_position_id, Utc::now()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(position = %source_position_id, error = %e, "Failed to archive record; will retry");
            self.lock().dirty.insert(source_position_id.to_string());
            return Err(e);
        }

        {
            let mut inner = self.lock();
            inner.records.remove(source_position_id);
            inner.dirty.remove(source_position_id);
        }
        info!(position = %source_position_id, "Replication record archived");
        Ok(())
    }

    /// Retry writes that previously failed.
    pub async fn flush_dirty(&self) -> Result<usize, StoreError> {
        let pending: Vec<ReplicationRecord> = {
            let mut inner = self.lock();
            let ids = std::mem::take(&mut inner.dirty);
            ids.iter()
                .filter_map(|id| inner.records.get(id).cloned())
                .collect()
        };
        self.write_all(&pending).await
    }

    /// Write every live record to storage.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let all = {
            let mut inner = self.lock();
            inner.dirty.clear();
            inner.records.values().cloned().collect::<Vec<_>>()
        };
        self.write_all(&all).await
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        let mut stats = StoreStats {
            records: inner.records.len(),
            ..Default::default()
        };
        for entry in inner.records.values().flat_map(|r| r.entries.values()) {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Open => stats.open += 1,
                EntryStatus::ClosePending => stats.close_pending += 1,
                EntryStatus::Closed => stats.closed += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
            if entry.held {
                stats.held += 1;
            }
        }
        stats
    }

    async fn write_all(&self, records: &[ReplicationRecord]) -> Result<usize, StoreError> {
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.repo.save_record(record).await {
                self.lock().dirty.insert(record.source_position_id.clone());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(records.len()),
        }
    }

    async fn persist_record(&self, record: &ReplicationRecord) {
        if let Err(e) = self.repo.save_record(record).await {
            error!(position = %record.source_position_id, error = %e, "Failed to persist record");
            self.lock().dirty.insert(record.source_position_id.clone());
        }
    }

    async fn persist_entry(&self, source_position_id: &str, entry: &DestinationEntry) {
        if let Err(e) = self.repo.save_entry(source_position_id, entry).await {
            warn!(
                position = %source_position_id,
                account = %entry.account_id,
                error = %e,
                "Failed to persist entry; will retry"
            );
            self.lock().dirty.insert(source_position_id.to_string());
        }
    }
}

fn entry_mut<'a>(
    inner: &'a mut Inner,
    source_position_id: &str,
    account_id: &str,
) -> Result<&'a mut DestinationEntry, StoreError> {
    inner
        .records
        .get_mut(source_position_id)
        .ok_or_else(|| StoreError::UnknownRecord(source_position_id.to_string()))?
        .entries
        .get_mut(account_id)
        .ok_or_else(|| StoreError::UnknownDestination {
            position: source_position_id.to_string(),
            account: account_id.to_string(),
        })
}
