//! Engine runner: the poll loop tying observer, dispatcher and store together.
//!
//! Each cycle:
//! - Polls the source and diffs it against the previous snapshot
//! - Dispatches opened/modified/closed events to every destination
//! - Reconciles live records against the snapshot
//! - Surfaces stale in-transit entries
//! - Retries store writes that previously failed

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{build_destination, DestinationClient, HttpSourceClient, SourceClient};
use crate::config::ReplicatorConfig;
use crate::db::Database;
use crate::notify::{FanoutNotifier, Notification, NotificationKind, Notifier};
use crate::retry::{BreakerSnapshot, BreakerState, RetryManager};
use crate::store::{RecordRepository, ReplicationStore, StaleEntry};
use crate::trading::{Dispatcher, PositionObserver, Translator};

/// Main engine runner.
pub struct Engine {
    config: ReplicatorConfig,
    observer: PositionObserver,
    dispatcher: Dispatcher,
    store: Arc<ReplicationStore>,
    notifier: Arc<dyn Notifier>,

    // Runtime state
    cycles: u64,
    source_failures: u64,
    last_poll_at: Option<DateTime<Utc>>,

    // Shutdown signal
    shutdown: Arc<watch::Sender<bool>>,
}

impl Engine {
    /// Build the engine from configuration: database, clients and notifier.
    pub async fn new(config: ReplicatorConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let repo: Arc<dyn RecordRepository> = Arc::new(db);
        let store = ReplicationStore::rehydrate(repo)
            .await
            .context("Failed to load replication state")?;

        let source: Arc<dyn SourceClient> = Arc::new(HttpSourceClient::new(&config.source)?);
        let destinations = config
            .destinations
            .iter()
            .map(build_destination)
            .collect::<Result<Vec<_>>>()?;
        let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::from_config(&config.notifications)?);

        Ok(Self::from_parts(
            config,
            source,
            destinations,
            Arc::new(store),
            notifier,
        ))
    }

    /// Assemble an engine around existing collaborators.
    pub fn from_parts(
        config: ReplicatorConfig,
        source: Arc<dyn SourceClient>,
        destinations: Vec<Arc<dyn DestinationClient>>,
        store: Arc<ReplicationStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let retry = RetryManager::new(
            config.retry.clone(),
            config.circuit_breaker.clone(),
            notifier.clone(),
            shutdown.subscribe(),
        );
        let translator = Translator::new(
            config.symbols.clone(),
            config.lots.clone(),
            config.copy_stop_take_profit,
        );
        let dispatcher = Dispatcher::new(destinations, translator, retry, store.clone(), notifier.clone());

        Self {
            config,
            observer: PositionObserver::new(source),
            dispatcher,
            store,
            notifier,
            cycles: 0,
            source_failures: 0,
            last_poll_at: None,
            shutdown,
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    /// Authenticate destinations and surface entries already stale at startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing replication engine...");

        let authenticated = self.dispatcher.authenticate_all().await;
        if authenticated < self.config.destinations.len() {
            warn!(
                authenticated = authenticated,
                configured = self.config.destinations.len(),
                "Some destinations failed to authenticate; they will be retried per operation"
            );
        }

        let stats = self.store.stats();
        if stats.held > 0 {
            warn!(
                held = stats.held,
                "Rehydrated entries were mid-operation; they stay held until resolved manually"
            );
        }
        self.surface_stale().await;

        info!(
            destinations = self.config.destinations.len(),
            records = stats.records,
            "Engine initialized"
        );
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            destinations = self.config.destinations.len(),
            "Starting replication loop"
        );

        let mut poll_interval = interval(self.config.poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.send_replace(true);
            }
        });

        let mut stop = self.shutdown.subscribe();
        let stopped = async move {
            let _ = stop.wait_for(|stop| *stop).await;
        };
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => self.cycle().await,
                _ = &mut stopped => break,
            }
        }

        // Graceful shutdown
        self.shutdown().await
    }

    /// Single iteration of the main loop.
    pub async fn cycle(&mut self) {
        self.cycles += 1;
        debug!(cycle = self.cycles, "Engine cycle");

        match self.observer.poll().await {
            Ok(diff) => {
                self.last_poll_at = Some(Utc::now());
                self.dispatcher.dispatch(&diff).await;

                let live = self.observer.snapshot().clone();
                self.dispatcher.reconcile(&live).await;
            }
            Err(e) => {
                // Nothing is inferred from a failed poll; try again next cycle
                self.source_failures += 1;
                debug!(error = %e, failures = self.source_failures, "Skipping cycle");
            }
        }

        self.surface_stale().await;

        if let Err(e) = self.store.flush_dirty().await {
            error!(error = %e, "Replication state still not persisted");
        }
    }

    async fn surface_stale(&self) {
        let stale = self
            .store
            .sweep_stale(Utc::now(), self.config.staleness_threshold());

        for entry in stale {
            warn!(
                position = %entry.source_position_id,
                account = %entry.account_id,
                status = %entry.status,
                idle_secs = entry.idle_for.num_seconds(),
                held = entry.held,
                "Stale replication entry; verify against the destination's live orders"
            );
            self.notifier
                .notify(
                    Notification::new(NotificationKind::StalenessWarning, describe_stale(&entry))
                        .position(&entry.source_position_id)
                        .account(&entry.account_id),
                )
                .await;
        }
    }

    /// Graceful shutdown: let in-flight work settle, then flush state.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down replication engine...");
        self.shutdown.send_replace(true);

        self.dispatcher.drain().await;

        let written = self
            .store
            .flush()
            .await
            .context("Failed to flush replication state")?;

        info!(records = written, "Engine shutdown complete");
        Ok(())
    }

    /// Get current stats.
    pub fn stats(&self) -> EngineStats {
        let store = self.store.stats();

        EngineStats {
            cycles: self.cycles,
            source_failures: self.source_failures,
            last_poll_at: self.last_poll_at,
            destinations: self.config.destinations.len(),
            records: store.records,
            pending: store.pending,
            open: store.open,
            close_pending: store.close_pending,
            closed: store.closed,
            failed: store.failed,
            held: store.held,
            in_flight: self.dispatcher.in_flight(),
            breakers: self.dispatcher.retry().breakers(),
        }
    }
}

fn describe_stale(entry: &StaleEntry) -> String {
    let mut detail = format!(
        "{} for {}s; verify against the destination's live orders",
        entry.status,
        entry.idle_for.num_seconds()
    );
    if entry.held {
        detail.push_str(" (held since restart; resolve with `replicator resolve`)");
    }
    detail
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub cycles: u64,
    pub source_failures: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub destinations: usize,
    pub records: usize,
    pub pending: usize,
    pub open: usize,
    pub close_pending: usize,
    pub closed: usize,
    pub failed: usize,
    pub held: usize,
    pub in_flight: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

impl EngineStats {
    /// Breakers not currently closed.
    pub fn breakers_open(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state != BreakerState::Closed)
            .count()
    }
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Replication Statistics ===")?;
        writeln!(f, "Cycles:          {} (source failures: {})", self.cycles, self.source_failures)?;
        writeln!(
            f,
            "Last Poll:       {}",
            self.last_poll_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        )?;
        writeln!(f, "Destinations:    {} ({} breakers open)", self.destinations, self.breakers_open())?;
        writeln!(f, "Live Records:    {}", self.records)?;
        writeln!(
            f,
            "Entries:         PENDING {} | OPEN {} | CLOSE_PENDING {} | CLOSED {} | FAILED {}",
            self.pending, self.open, self.close_pending, self.closed, self.failed
        )?;
        writeln!(f, "Held:            {}", self.held)?;
        writeln!(f, "In Flight:       {}", self.in_flight)?;

        for b in self.breakers.iter().filter(|b| b.state != BreakerState::Closed) {
            let since = b
                .opened_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            let trial = b
                .next_trial_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "  {} {} since {} ({} failures, next trial {})",
                b.account_id, b.state, since, b.consecutive_failures, trial
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::sample_config;
    use crate::models::{EntryStatus, Outcome};
    use crate::testkit::{position, MemoryRepository, RecordingNotifier, ScriptedDestination, ScriptedSource};
    use rust_decimal_macros::dec;

    struct Parts {
        source: Arc<ScriptedSource>,
        e8: Arc<ScriptedDestination>,
        ftmo: Arc<ScriptedDestination>,
        repo: Arc<MemoryRepository>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Parts {
        fn new() -> Self {
            Self {
                source: Arc::new(ScriptedSource::default()),
                e8: Arc::new(ScriptedDestination::new("e8-1")),
                ftmo: Arc::new(ScriptedDestination::new("ftmo-1")),
                repo: Arc::new(MemoryRepository::default()),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn engine(&self, store: ReplicationStore) -> Engine {
            Engine::from_parts(
                sample_config(),
                self.source.clone(),
                vec![self.e8.clone() as Arc<dyn DestinationClient>, self.ftmo.clone()],
                Arc::new(store),
                self.notifier.clone(),
            )
        }

        fn fresh_engine(&self) -> Engine {
            self.engine(ReplicationStore::new(self.repo.clone()))
        }
    }

    #[tokio::test]
    async fn test_source_outage_closes_nothing() {
        let parts = Parts::new();
        let mut engine = parts.fresh_engine();

        parts.source.set(vec![position("P1", "EURUSD.z", dec!(1.0))]);
        engine.cycle().await;
        engine.dispatcher.drain().await;
        assert_eq!(engine.stats().open, 2);

        parts.source.fail_next("bridge timeout");
        engine.cycle().await;
        engine.dispatcher.drain().await;

        assert_eq!(parts.e8.close_calls() + parts.ftmo.close_calls(), 0);
        let stats = engine.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.source_failures, 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_without_duplicates() {
        let parts = Parts::new();
        parts.source.set(vec![position("P1", "EURUSD.z", dec!(1.0))]);
        {
            let mut engine = parts.fresh_engine();
            engine.cycle().await;
            engine.dispatcher.drain().await;
            engine.store.flush().await.unwrap();
        }

        let store = ReplicationStore::rehydrate(parts.repo.clone()).await.unwrap();
        let mut engine = parts.engine(store);
        engine.cycle().await;
        engine.dispatcher.drain().await;

        // Already OPEN everywhere: the fresh snapshot re-reports P1 as opened
        // but nothing new is placed.
        assert_eq!(parts.e8.open_calls(), 1);
        assert_eq!(parts.ftmo.open_calls(), 1);

        // Closed while the engine is running again
        parts.source.set(vec![]);
        engine.cycle().await;
        engine.dispatcher.drain().await;
        assert_eq!(parts.e8.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_rehydrated_stale_entry_is_warned_not_resumed() {
        let parts = Parts::new();
        {
            let store = ReplicationStore::new(parts.repo.clone());
            store
                .begin_replication(
                    &position("P1", "EURUSD.z", dec!(1.0)),
                    &["e8-1".to_string(), "ftmo-1".to_string()],
                )
                .await;
            store
                .record_outcome("P1", "e8-1", Outcome::Opened { order_id: "A1".into() }, 1)
                .await
                .unwrap();
        }

        let store = ReplicationStore::rehydrate(parts.repo.clone()).await.unwrap();
        let mut config = sample_config();
        config.staleness_threshold_secs = 0;
        let mut engine = Engine::from_parts(
            config,
            parts.source.clone(),
            vec![parts.e8.clone() as Arc<dyn DestinationClient>, parts.ftmo.clone()],
            Arc::new(store),
            parts.notifier.clone(),
        );
        engine.initialize().await.unwrap();

        let warnings = parts.notifier.of_kind(NotificationKind::StalenessWarning);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].destination_account_id.as_deref(), Some("ftmo-1"));
        assert!(warnings[0].detail.contains("held"));

        parts.source.set(vec![position("P1", "EURUSD.z", dec!(1.0))]);
        engine.cycle().await;
        engine.dispatcher.drain().await;

        // Held PENDING entry is never retried automatically, and warned once
        assert_eq!(parts.ftmo.open_calls(), 0);
        assert_eq!(parts.notifier.count(NotificationKind::StalenessWarning), 1);
        let record = engine.store.get("P1").unwrap();
        assert_eq!(record.entries["ftmo-1"].status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_flushes() {
        let parts = Parts::new();
        parts.source.set(vec![position("P1", "EURUSD.z", dec!(1.0))]);
        let mut engine = parts.fresh_engine();
        let signal = engine.shutdown_signal();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            signal.send_replace(true);
        });

        tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .expect("engine did not stop")
            .unwrap();

        let stats = engine.stats();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.open, 2);
        assert_eq!(parts.repo.live_count(), 1);
    }

    #[test]
    fn test_stats_display() {
        let stats = EngineStats {
            cycles: 3,
            source_failures: 1,
            last_poll_at: None,
            destinations: 2,
            records: 1,
            pending: 0,
            open: 2,
            close_pending: 0,
            closed: 0,
            failed: 0,
            held: 0,
            in_flight: 0,
            breakers: vec![
                BreakerSnapshot {
                    account_id: "e8-1".to_string(),
                    state: BreakerState::Open,
                    consecutive_failures: 5,
                    opened_at: Some(Utc::now()),
                    next_trial_at: Some(Utc::now()),
                },
                BreakerSnapshot {
                    account_id: "ftmo-1".to_string(),
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                    opened_at: None,
                    next_trial_at: None,
                },
            ],
        };
        assert_eq!(stats.breakers_open(), 1);
        let text = stats.to_string();
        assert!(text.contains("OPEN 2"));
        assert!(text.contains("Last Poll:       never"));
        assert!(text.contains("e8-1 OPEN since"));
        assert!(!text.contains("ftmo-1"));
    }
}
