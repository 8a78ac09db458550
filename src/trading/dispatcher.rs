//! Destination dispatcher: fans source events out to every destination
//! account.
//!
//! Each (position, account) unit of work is claimed in the store and then
//! spawned onto a `JoinSet`, so a slow or failing account never holds up the
//! poll loop, other accounts or other positions. Anything that cannot be done
//! now (a close racing an unresolved open, a circuit-open destination) is left
//! in place and picked up by the reconcile pass on a later cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::{DestinationClient, DestinationError};
use crate::models::{EntryStatus, Outcome, ReplicationRecord, SourcePosition, TranslatedOrder};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::retry::{DispatchFailure, RetryManager};
use crate::store::ReplicationStore;

use super::observer::PositionDiff;
use super::translator::Translator;

/// State shared with spawned work units.
struct Shared {
    destinations: BTreeMap<String, Arc<dyn DestinationClient>>,
    account_ids: Vec<String>,
    translator: Translator,
    retry: RetryManager,
    store: Arc<ReplicationStore>,
    notifier: Arc<dyn Notifier>,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        destinations: Vec<Arc<dyn DestinationClient>>,
        translator: Translator,
        retry: RetryManager,
        store: Arc<ReplicationStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let destinations: BTreeMap<_, _> = destinations
            .into_iter()
            .map(|d| (d.account_id().to_string(), d))
            .collect();
        let account_ids = destinations.keys().cloned().collect();

        Self {
            shared: Arc::new(Shared {
                destinations,
                account_ids,
                translator,
                retry,
                store,
                notifier,
            }),
            tasks: JoinSet::new(),
        }
    }

    pub fn retry(&self) -> &RetryManager {
        &self.shared.retry
    }

    /// Work units still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Log in to every destination. Failures are notified, never fatal.
    pub async fn authenticate_all(&self) -> usize {
        let results = join_all(self.shared.destinations.values().map(|client| async move {
            (client.account_id().to_string(), client.authenticate().await)
        }))
        .await;

        let mut ok = 0;
        for (account, result) in results {
            match result {
                Ok(()) => {
                    info!(account = %account, "Destination authenticated");
                    ok += 1;
                }
                Err(e) => {
                    error!(account = %account, error = %e, "Destination authentication failed");
                    self.shared
                        .notifier
                        .notify(
                            Notification::new(NotificationKind::AuthenticationFailed, e.to_string())
                                .account(&account),
                        )
                        .await;
                }
            }
        }
        ok
    }

    /// Handle one poll's worth of source changes, in detection order.
    pub async fn dispatch(&mut self, diff: &PositionDiff) {
        for position in &diff.opened {
            self.on_opened(position).await;
        }
        for position in &diff.modified {
            self.on_modified(position).await;
        }
        for position in &diff.closed {
            self.on_closed(position).await;
        }
        self.reap();
    }

    /// Bring every live record in line with the latest source snapshot.
    pub async fn reconcile(&mut self, live: &BTreeMap<String, SourcePosition>) {
        for record in self.shared.store.snapshot() {
            let source = live.get(&record.source_position_id);
            self.reconcile_record(&record, source).await;
        }
        self.reap();
    }

    /// Wait for every spawned work unit to finish.
    pub async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!(in_flight = self.tasks.len(), "Waiting for in-flight destination operations");
        while let Some(result) = self.tasks.join_next().await {
            log_join(result);
        }
    }

    /// Collect finished work units without waiting.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
            reaped += 1;
        }
        reaped
    }

    async fn on_opened(&mut self, position: &SourcePosition) {
        let (record, created) = self
            .shared
            .store
            .begin_replication(position, &self.shared.account_ids)
            .await;

        if created {
            info!(
                position = %position.position_id,
                symbol = %position.symbol,
                direction = %position.direction,
                volume = %position.volume,
                "New source position"
            );
        } else {
            debug!(position = %position.position_id, "Source position already tracked");
        }

        let pending = accounts_in(&record, EntryStatus::Pending);
        self.start_opens(position, &pending).await;
    }

    async fn on_modified(&mut self, position: &SourcePosition) {
        let Some(previous) = self.shared.store.get(&position.position_id) else {
            debug!(position = %position.position_id, "Modify for untracked position");
            return;
        };

        if position.volume != previous.source.volume {
            info!(
                position = %position.position_id,
                from = %previous.source.volume,
                to = %position.volume,
                "Source volume changed; live replicas keep their size"
            );
        }

        if let Err(e) = self.shared.store.update_source(position).await {
            warn!(position = %position.position_id, error = %e, "Failed to refresh source state");
            return;
        }

        if !position.protection_changed(&previous.source) {
            return;
        }
        for account in accounts_in(&previous, EntryStatus::Open) {
            self.start_modify(position, &account);
        }
    }

    async fn on_closed(&mut self, position: &SourcePosition) {
        match self.shared.store.get(&position.position_id) {
            Some(record) => {
                info!(
                    position = %position.position_id,
                    open_replicas = record.count(EntryStatus::Open),
                    "Source position closed"
                );
                self.reconcile_record(&record, None).await;
            }
            None => debug!(position = %position.position_id, "Close for untracked position"),
        }
    }

    async fn reconcile_record(&mut self, record: &ReplicationRecord, source: Option<&SourcePosition>) {
        let id = &record.source_position_id;

        let Some(position) = source else {
            if record.all_terminal() {
                if let Err(e) = self.shared.store.archive(id).await {
                    warn!(position = %id, error = %e, "Failed to archive record");
                }
                return;
            }
            for (account, entry) in &record.entries {
                match entry.status {
                    EntryStatus::Pending => self.abandon_open(id, account).await,
                    EntryStatus::Open => self.start_close(id, account, EntryStatus::Open).await,
                    EntryStatus::ClosePending => {
                        self.start_close(id, account, EntryStatus::ClosePending).await
                    }
                    EntryStatus::Closed | EntryStatus::Failed => {}
                }
            }
            return;
        };

        let pending = accounts_in(record, EntryStatus::Pending);
        self.start_opens(position, &pending).await;

        for (account, entry) in &record.entries {
            match entry.status {
                EntryStatus::Open => self.start_modify(position, account),
                EntryStatus::ClosePending => {
                    self.start_close(id, account, EntryStatus::ClosePending).await
                }
                _ => {}
            }
        }
    }

    async fn start_opens(&mut self, position: &SourcePosition, accounts: &[String]) {
        let id = &position.position_id;
        let claimed: Vec<String> = accounts
            .iter()
            .filter(|account| {
                self.shared
                    .store
                    .claim(id, account, EntryStatus::Pending)
                    .is_some()
            })
            .cloned()
            .collect();
        if claimed.is_empty() {
            return;
        }

        let translation = match self.shared.translator.translate(position) {
            Ok(t) => t,
            Err(e) => {
                warn!(position = %id, error = %e, "Cannot translate source position");
                for account in &claimed {
                    self.shared.fail_open(id, account, e.to_string(), 0).await;
                    self.shared.store.release(id, account);
                }
                return;
            }
        };

        if translation.volume.clamped {
            warn!(
                position = %id,
                requested = %translation.volume.requested,
                volume = %translation.volume.volume,
                "Volume clamped to lot bounds"
            );
        }

        for account in claimed {
            let shared = self.shared.clone();
            let order = translation.order.clone();
            let id = id.clone();
            self.tasks.spawn(async move {
                shared.open_on(&id, &account, &order).await;
                shared.store.release(&id, &account);
            });
        }
    }

    /// Source closed while nothing was placed yet.
    async fn abandon_open(&mut self, id: &str, account: &str) {
        if self.shared.store.claim(id, account, EntryStatus::Pending).is_none() {
            debug!(position = %id, account = %account, "Close deferred until open resolves");
            return;
        }
        self.shared
            .fail_open(id, account, "source position closed before replication".into(), 0)
            .await;
        self.shared.store.release(id, account);
    }

    async fn start_close(&mut self, id: &str, account: &str, from: EntryStatus) {
        let Some(entry) = self.shared.store.claim(id, account, from) else {
            return;
        };

        if from == EntryStatus::Open {
            if let Err(e) = self
                .shared
                .store
                .record_outcome(id, account, Outcome::CloseRequested, 0)
                .await
            {
                warn!(position = %id, account = %account, error = %e, "Cannot start close");
                self.shared.store.release(id, account);
                return;
            }
        }

        let Some(order_id) = entry.order_id else {
            self.shared
                .fail_close(id, account, "-", "no destination order id recorded".into(), 0)
                .await;
            self.shared.store.release(id, account);
            return;
        };

        let shared = self.shared.clone();
        let id = id.to_string();
        let account = account.to_string();
        self.tasks.spawn(async move {
            shared.close_on(&id, &account, &order_id).await;
            shared.store.release(&id, &account);
        });
    }

    fn start_modify(&mut self, position: &SourcePosition, account: &str) {
        if !self.shared.translator.copies_stop_take_profit() {
            return;
        }
        let id = &position.position_id;
        let (stop_loss, take_profit) = self.shared.translator.protection(position);

        let Some(entry) = self.shared.store.claim(id, account, EntryStatus::Open) else {
            return;
        };
        let Some(order_id) = entry.order_id.clone() else {
            self.shared.store.release(id, account);
            return;
        };
        if entry.applied_stop_loss == stop_loss && entry.applied_take_profit == take_profit {
            self.shared.store.release(id, account);
            return;
        }

        // Only the first failure of a streak is notified
        let first_failure = entry.last_error.is_none();
        let shared = self.shared.clone();
        let id = id.clone();
        let account = account.to_string();
        self.tasks.spawn(async move {
            shared
                .modify_on(&id, &account, &order_id, stop_loss, take_profit, first_failure)
                .await;
            shared.store.release(&id, &account);
        });
    }
}

impl Shared {
    fn client(&self, account: &str) -> Option<&Arc<dyn DestinationClient>> {
        self.destinations.get(account)
    }

    async fn notify(&self, kind: NotificationKind, id: &str, account: &str, detail: String) {
        self.notifier
            .notify(Notification::new(kind, detail).position(id).account(account))
            .await;
    }

    async fn open_on(&self, id: &str, account: &str, order: &TranslatedOrder) {
        let Some(client) = self.client(account) else {
            return;
        };

        let result = self
            .retry
            .execute(account, move || client.open_order(order))
            .await;

        let failure = match result {
            Ok(done) => {
                let outcome = Outcome::Opened {
                    order_id: done.value.clone(),
                };
                if let Err(e) = self.store.record_outcome(id, account, outcome, done.attempts).await {
                    // The order exists remotely but the store refused it
                    error!(
                        position = %id,
                        account = %account,
                        order_id = %done.value,
                        error = %e,
                        "Opened order could not be recorded"
                    );
                    self.notify(
                        NotificationKind::ReplicationFailed,
                        id,
                        account,
                        format!(
                            "order {} opened but not recorded ({}); verify manually",
                            done.value, e
                        ),
                    )
                    .await;
                    return;
                }

                if let Err(e) = self
                    .store
                    .mark_applied_protection(id, account, order.stop_loss, order.take_profit)
                    .await
                {
                    warn!(position = %id, account = %account, error = %e, "Failed to record protection");
                }

                info!(
                    position = %id,
                    account = %account,
                    order_id = %done.value,
                    attempts = done.attempts,
                    "Replica opened"
                );
                self.notify(
                    NotificationKind::ReplicationOpened,
                    id,
                    account,
                    format!(
                        "opened {} {} {} as order {} after {} attempt{}",
                        order.direction,
                        order.destination_volume,
                        order.destination_symbol,
                        done.value,
                        done.attempts,
                        if done.attempts == 1 { "" } else { "s" }
                    ),
                )
                .await;
                return;
            }
            Err(failure) => failure,
        };

        match failure {
            DispatchFailure::CircuitOpen { retry_at, attempts } => {
                self.deferred(id, account, "open", retry_at, attempts).await;
            }
            DispatchFailure::Interrupted { error, attempts } => {
                self.interrupted(id, account, attempts, &error).await;
            }
            failure => {
                let attempts = failure.attempts();
                self.fail_open(id, account, failure.to_string(), attempts).await;
            }
        }
    }

    async fn fail_open(&self, id: &str, account: &str, reason: String, attempts: u32) {
        let outcome = Outcome::OpenFailed {
            reason: reason.clone(),
        };
        if let Err(e) = self.store.record_outcome(id, account, outcome, attempts).await {
            warn!(position = %id, account = %account, error = %e, "Failed to record open failure");
            return;
        }
        warn!(position = %id, account = %account, reason = %reason, "Replication failed");
        self.notify(NotificationKind::ReplicationFailed, id, account, reason)
            .await;
    }

    async fn close_on(&self, id: &str, account: &str, order_id: &str) {
        let Some(client) = self.client(account) else {
            return;
        };

        let result = self
            .retry
            .execute(account, move || client.close_order(order_id))
            .await;

        match result {
            Ok(done) => {
                match self
                    .store
                    .record_outcome(id, account, Outcome::Closed, done.attempts)
                    .await
                {
                    Ok(_) => {
                        info!(position = %id, account = %account, order_id = %order_id, "Replica closed");
                        self.notify(
                            NotificationKind::ReplicationClosed,
                            id,
                            account,
                            format!("closed order {}", order_id),
                        )
                        .await;
                    }
                    Err(e) => {
                        error!(position = %id, account = %account, error = %e, "Close could not be recorded")
                    }
                }
            }
            Err(DispatchFailure::CircuitOpen { retry_at, attempts }) => {
                self.deferred(id, account, "close", retry_at, attempts).await;
            }
            Err(DispatchFailure::Interrupted { error, attempts }) => {
                self.interrupted(id, account, attempts, &error).await;
            }
            Err(failure) => {
                let reason = match failure.error() {
                    Some(DestinationError::NotFound(_)) => format!(
                        "order {} not found on destination; it may have been closed externally, verify manually",
                        order_id
                    ),
                    _ => format!(
                        "{}; order {} is still open and needs manual intervention",
                        failure, order_id
                    ),
                };
                self.fail_close(id, account, order_id, reason, failure.attempts())
                    .await;
            }
        }
    }

    async fn fail_close(&self, id: &str, account: &str, order_id: &str, reason: String, attempts: u32) {
        let outcome = Outcome::CloseFailed {
            reason: reason.clone(),
        };
        if let Err(e) = self.store.record_outcome(id, account, outcome, attempts).await {
            warn!(position = %id, account = %account, error = %e, "Failed to record close failure");
            return;
        }
        error!(position = %id, account = %account, order_id = %order_id, reason = %reason, "Close failed");
        self.notify(NotificationKind::CloseFailed, id, account, reason)
            .await;
    }

    async fn modify_on(
        &self,
        id: &str,
        account: &str,
        order_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        first_failure: bool,
    ) {
        let Some(client) = self.client(account) else {
            return;
        };

        let result = self
            .retry
            .execute(account, move || {
                client.modify_order(order_id, stop_loss, take_profit)
            })
            .await;

        match result {
            Ok(done) => {
                if let Err(e) = self
                    .store
                    .note_attempts(id, account, done.attempts, None)
                    .await
                {
                    warn!(position = %id, account = %account, error = %e, "Failed to count attempts");
                }
                if let Err(e) = self
                    .store
                    .mark_applied_protection(id, account, stop_loss, take_profit)
                    .await
                {
                    warn!(position = %id, account = %account, error = %e, "Failed to record protection");
                }
                info!(
                    position = %id,
                    account = %account,
                    stop_loss = ?stop_loss,
                    take_profit = ?take_profit,
                    "Replica protection updated"
                );
            }
            Err(DispatchFailure::CircuitOpen { retry_at, attempts }) => {
                self.deferred(id, account, "modify", retry_at, attempts).await;
            }
            Err(failure) => {
                let reason = failure.to_string();
                if let Err(e) = self
                    .store
                    .note_attempts(id, account, failure.attempts(), Some(reason.clone()))
                    .await
                {
                    warn!(position = %id, account = %account, error = %e, "Failed to record modify error");
                }
                warn!(position = %id, account = %account, reason = %reason, "Modify failed; will retry next cycle");
                if first_failure && !matches!(failure, DispatchFailure::Interrupted { .. }) {
                    self.notify(NotificationKind::ModifyFailed, id, account, reason)
                        .await;
                }
            }
        }
    }

    /// Circuit open: leave the entry as it is for a later cycle.
    async fn deferred(
        &self,
        id: &str,
        account: &str,
        operation: &str,
        retry_at: DateTime<Utc>,
        attempts: u32,
    ) {
        if let Err(e) = self.store.note_attempts(id, account, attempts, None).await {
            warn!(position = %id, account = %account, error = %e, "Failed to count attempts");
        }
        debug!(
            position = %id,
            account = %account,
            operation = operation,
            retry_at = %retry_at,
            "Destination circuit open; deferred"
        );
    }

    /// Shutdown stopped a retry loop: the remote outcome is unknown.
    async fn interrupted(&self, id: &str, account: &str, attempts: u32, error: &DestinationError) {
        if let Err(e) = self
            .store
            .note_attempts(id, account, attempts, Some(format!("interrupted: {}", error)))
            .await
        {
            warn!(position = %id, account = %account, error = %e, "Failed to record interruption");
        }
        self.store.hold(id, account);
        warn!(position = %id, account = %account, "Operation interrupted by shutdown; entry held");
    }
}

fn accounts_in(record: &ReplicationRecord, status: EntryStatus) -> Vec<String> {
    record
        .entries
        .iter()
        .filter(|(_, e)| e.status == status)
        .map(|(account, _)| account.clone())
        .collect()
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Destination work unit panicked");
        }
    }
}
