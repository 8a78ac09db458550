//! Test doubles for the collaborator interfaces.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::{DestinationClient, DestinationError, SourceClient, SourceError};
use crate::models::{DestinationEntry, Direction, ReplicationRecord, SourcePosition, TranslatedOrder};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::store::{RecordRepository, StoreError, StoredRecord};

/// A BUY position with a stop-loss and no take-profit.
pub fn position(id: &str, symbol: &str, volume: Decimal) -> SourcePosition {
    SourcePosition {
        position_id: id.to_string(),
        symbol: symbol.to_string(),
        direction: Direction::Buy,
        volume,
        open_price: dec!(1.0850),
        stop_loss: Some(dec!(1.0800)),
        take_profit: None,
        open_time: Utc::now(),
    }
}

/// Source that returns whatever was last `set`.
#[derive(Default)]
pub struct ScriptedSource {
    positions: Mutex<Vec<SourcePosition>>,
    failure: Mutex<Option<String>>,
}

impl ScriptedSource {
    pub fn set(&self, positions: Vec<SourcePosition>) {
        *self.positions.lock().unwrap() = positions;
    }

    pub fn fail_next(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn fetch_open_positions(&self) -> Result<Vec<SourcePosition>, SourceError> {
        if let Some(message) = self.failure.lock().unwrap().take() {
            return Err(SourceError::Unavailable(message));
        }
        Ok(self.positions.lock().unwrap().clone())
    }
}

/// Destination that returns queued results, defaulting to success.
pub struct ScriptedDestination {
    account_id: String,
    opens: Mutex<VecDeque<Result<String, DestinationError>>>,
    closes: Mutex<VecDeque<Result<(), DestinationError>>>,
    modifies: Mutex<VecDeque<Result<(), DestinationError>>>,
    delay: Mutex<Option<Duration>>,
    auth_fails: AtomicBool,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
    modify_calls: AtomicU32,
    placed: AtomicU32,
}

impl ScriptedDestination {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            opens: Mutex::new(VecDeque::new()),
            closes: Mutex::new(VecDeque::new()),
            modifies: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            auth_fails: AtomicBool::new(false),
            open_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            modify_calls: AtomicU32::new(0),
            placed: AtomicU32::new(0),
        }
    }

    pub fn queue_open(&self, result: Result<String, DestinationError>) {
        self.opens.lock().unwrap().push_back(result);
    }

    pub fn queue_close(&self, result: Result<(), DestinationError>) {
        self.closes.lock().unwrap().push_back(result);
    }

    pub fn queue_modify(&self, result: Result<(), DestinationError>) {
        self.modifies.lock().unwrap().push_back(result);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_auth(&self) {
        self.auth_fails.store(true, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn modify_calls(&self) -> u32 {
        self.modify_calls.load(Ordering::SeqCst)
    }

    /// Successful opens, i.e. orders that exist on the destination.
    pub fn orders_placed(&self) -> u32 {
        self.placed.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DestinationClient for ScriptedDestination {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn authenticate(&self) -> Result<(), DestinationError> {
        if self.auth_fails.load(Ordering::SeqCst) {
            return Err(DestinationError::AuthFailed("invalid credentials".into()));
        }
        Ok(())
    }

    async fn open_order(&self, _order: &TranslatedOrder) -> Result<String, DestinationError> {
        let n = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.pause().await;
        let result = self
            .opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}-{}", self.account_id, n)));
        if result.is_ok() {
            self.placed.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn close_order(&self, _order_id: &str) -> Result<(), DestinationError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.closes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn modify_order(
        &self,
        _order_id: &str,
        _stop_loss: Option<Decimal>,
        _take_profit: Option<Decimal>,
    ) -> Result<(), DestinationError> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.modifies.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Keeps every notification it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.events()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.of_kind(kind).len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: Notification) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct Rows {
    records: BTreeMap<String, (ReplicationRecord, Option<DateTime<Utc>>)>,
}

/// Repository held in memory, with the same version guard as SQLite.
#[derive(Default)]
pub struct MemoryRepository {
    rows: Mutex<Rows>,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn live_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|(_, archived)| archived.is_none())
            .count()
    }

    pub fn archived_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|(_, archived)| archived.is_some())
            .count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence("disk unavailable".into()));
        }
        Ok(())
    }
}

fn upsert(entries: &mut BTreeMap<String, DestinationEntry>, entry: &DestinationEntry) {
    let mut stored = entry.clone();
    stored.in_flight = false;
    stored.held = false;
    stored.stale_warned = false;

    match entries.get(&entry.account_id) {
        Some(existing) if existing.version >= entry.version => {}
        _ => {
            entries.insert(entry.account_id.clone(), stored);
        }
    }
}

#[async_trait]
impl RecordRepository for MemoryRepository {
    async fn save_record(&self, record: &ReplicationRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let slot = rows
            .records
            .entry(record.source_position_id.clone())
            .or_insert_with(|| {
                let mut empty = record.clone();
                empty.entries.clear();
                (empty, None)
            });
        slot.0.source = record.source.clone();
        for entry in record.entries.values() {
            upsert(&mut slot.0.entries, entry);
        }
        Ok(())
    }

    async fn save_entry(
        &self,
        source_position_id: &str,
        entry: &DestinationEntry,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let slot = rows
            .records
            .get_mut(source_position_id)
            .ok_or_else(|| StoreError::UnknownRecord(source_position_id.to_string()))?;
        upsert(&mut slot.0.entries, entry);
        Ok(())
    }

    async fn load(&self, include_archived: bool) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .records
            .values()
            .filter(|(_, archived)| include_archived || archived.is_none())
            .map(|(record, archived)| StoredRecord {
                record: record.clone(),
                archived_at: *archived,
            })
            .collect())
    }

    async fn archive(&self, source_position_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(slot) = rows.records.get_mut(source_position_id) {
            slot.1 = Some(at);
        }
        Ok(())
    }
}
