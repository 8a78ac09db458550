//! Replication record: the durable join between a source position and its
//! replicas on every destination account.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use super::SourcePosition;

/// Per-destination replication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Pending,
    Open,
    ClosePending,
    Closed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Open => "OPEN",
            EntryStatus::ClosePending => "CLOSE_PENDING",
            EntryStatus::Closed => "CLOSED",
            EntryStatus::Failed => "FAILED",
        }
    }

    /// Terminal entries are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Closed | EntryStatus::Failed)
    }

    /// Whether the remote side may be mid-operation for this entry.
    pub fn is_in_transit(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::ClosePending)
    }

    fn can_move_to(&self, to: EntryStatus) -> bool {
        matches!(
            (self, to),
            (EntryStatus::Pending, EntryStatus::Open)
                | (EntryStatus::Pending, EntryStatus::Failed)
                | (EntryStatus::Open, EntryStatus::ClosePending)
                | (EntryStatus::ClosePending, EntryStatus::Closed)
                | (EntryStatus::ClosePending, EntryStatus::Failed)
        )
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "OPEN" => Ok(Self::Open),
            "CLOSE_PENDING" => Ok(Self::ClosePending),
            "CLOSED" => Ok(Self::Closed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown entry status: {}", other)),
        }
    }
}

/// Result reported for one destination of one source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Open order accepted by the destination
    Opened { order_id: String },
    /// Open permanently failed
    OpenFailed { reason: String },
    /// Source closed; close about to be sent
    CloseRequested,
    /// Close confirmed by the destination
    Closed,
    /// Close permanently failed; the destination trade is still live
    CloseFailed { reason: String },
}

impl Outcome {
    pub fn target(&self) -> EntryStatus {
        match self {
            Outcome::Opened { .. } => EntryStatus::Open,
            Outcome::OpenFailed { .. } => EntryStatus::Failed,
            Outcome::CloseRequested => EntryStatus::ClosePending,
            Outcome::Closed => EntryStatus::Closed,
            Outcome::CloseFailed { .. } => EntryStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: EntryStatus,
    pub to: EntryStatus,
}

/// Replica state on a single destination account.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationEntry {
    pub account_id: String,
    pub status: EntryStatus,
    pub order_id: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// Stop/take-profit currently set on the destination order
    pub applied_stop_loss: Option<Decimal>,
    pub applied_take_profit: Option<Decimal>,

    pub updated_at: DateTime<Utc>,

    /// Bumped on every write; persistence refuses to go backwards
    pub version: i64,

    // Runtime-only flags, never persisted
    pub in_flight: bool,
    pub held: bool,
    pub stale_warned: bool,
}

impl DestinationEntry {
    pub fn pending(account_id: String, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            status: EntryStatus::Pending,
            order_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            applied_stop_loss: None,
            applied_take_profit: None,
            updated_at: now,
            version: 1,
            in_flight: false,
            held: false,
            stale_warned: false,
        }
    }

    /// Apply an outcome, refusing anything out of a terminal state or not on
    /// the allowed transition graph.
    pub fn apply(&mut self, outcome: &Outcome, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let to = outcome.target();
        if !self.status.can_move_to(to) {
            return Err(TransitionError { from: self.status, to });
        }

        match outcome {
            Outcome::Opened { order_id } => {
                self.order_id = Some(order_id.clone());
                self.last_error = None;
            }
            Outcome::OpenFailed { reason } | Outcome::CloseFailed { reason } => {
                self.last_error = Some(reason.clone());
            }
            Outcome::CloseRequested | Outcome::Closed => {}
        }

        self.status = to;
        self.held = false;
        self.stale_warned = false;
        self.touch(now);
        Ok(())
    }

    /// Account for attempts made against the destination.
    pub fn note_attempts(&mut self, attempts: u32, now: DateTime<Utc>) {
        if attempts == 0 {
            return;
        }
        self.attempt_count += attempts;
        self.last_attempt_at = Some(now);
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    /// Time since this entry last changed, used for staleness checks.
    pub fn idle_since(&self) -> DateTime<Utc> {
        match self.last_attempt_at {
            Some(at) if at > self.updated_at => at,
            _ => self.updated_at,
        }
    }
}

/// Join between one source position and its replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRecord {
    pub source_position_id: String,

    /// Last observed source state, kept so work can be re-translated later
    pub source: SourcePosition,

    /// Keyed by destination account id
    pub entries: BTreeMap<String, DestinationEntry>,

    pub created_at: DateTime<Utc>,
}

impl ReplicationRecord {
    pub fn new(source: SourcePosition, account_ids: &[String], now: DateTime<Utc>) -> Self {
        let entries = account_ids
            .iter()
            .map(|id| (id.clone(), DestinationEntry::pending(id.clone(), now)))
            .collect();

        Self {
            source_position_id: source.position_id.clone(),
            source,
            entries,
            created_at: now,
        }
    }

    pub fn entry(&self, account_id: &str) -> Option<&DestinationEntry> {
        self.entries.get(account_id)
    }

    pub fn all_terminal(&self) -> bool {
        self.entries.values().all(|e| e.status.is_terminal())
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}
