//! MT5 Trade Replicator
//!
//! Mirrors open positions from a MetaTrader 5 terminal onto multiple
//! prop-firm destination accounts, with per-account retries and circuit
//! breakers so one failing account never stalls the others.

mod api;
mod config;
mod db;
mod engine;
mod models;
mod notify;
mod retry;
mod store;
mod trading;

#[cfg(test)]
mod testkit;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::ReplicatorConfig;
use crate::db::Database;
use crate::engine::Engine;
use crate::models::{EntryStatus, Outcome};
use crate::notify::FanoutNotifier;
use crate::store::{RecordRepository, ReplicationStore};

/// MT5 to multi-account trade replicator CLI.
#[derive(Parser)]
#[command(name = "replicator")]
#[command(about = "Replicate MT5 positions onto prop-firm accounts", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "REPLICATOR_CONFIG", default_value = "replicator.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start replicating until Ctrl+C
    Run,

    /// Validate the configuration and print a summary
    CheckConfig,

    /// List replication records and their per-account status
    Records {
        /// Include archived records
        #[arg(long)]
        all: bool,
    },

    /// Manually settle a held or stale destination entry
    #[command(group(
        ArgGroup::new("resolution")
            .required(true)
            .args(["order_id", "failed", "closed"])
    ))]
    Resolve {
        /// Source position id (MT5 ticket)
        position: String,

        /// Destination account id
        account: String,

        /// The open went through; this is the destination order id
        #[arg(long)]
        order_id: Option<String>,

        /// The operation did not go through on the destination
        #[arg(long)]
        failed: bool,

        /// The destination order is confirmed closed
        #[arg(long)]
        closed: bool,

        /// Reason recorded with a failure
        #[arg(long)]
        reason: Option<String>,
    },
}

/// What the operator found on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Opened(String),
    Failed,
    Closed,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ReplicatorConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run => {
            info!(config = %cli.config.display(), "Starting trade replicator");

            let mut engine = Engine::new(config.clone()).await?;
            engine.initialize().await?;

            println!("\n=== MT5 Trade Replicator ===");
            println!("Source bridge:    {}", config.source.bridge_url);
            println!("Destinations:     {}", config.account_ids().join(", "));
            println!("Poll interval:    {}ms", config.poll_interval_ms);
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Engine error");
            }

            println!("\n{}", engine.stats());
        }

        Commands::CheckConfig => print_config(&config)?,

        Commands::Records { all } => {
            let db = Database::new(&config.database_url).await?;
            let records = db.load(all).await.context("Failed to load records")?;

            if records.is_empty() {
                println!("No replication records.");
                return Ok(());
            }

            println!(
                "\n{:<14} {:<12} {:<5} {:>8} {:<16} {:<14} {:>8} {:<20}",
                "POSITION", "SYMBOL", "DIR", "VOLUME", "ACCOUNT", "STATUS", "ATTEMPTS", "ORDER"
            );
            println!("{}", "-".repeat(104));

            for stored in records {
                let record = &stored.record;
                let archived = if stored.archived_at.is_some() { " (archived)" } else { "" };

                for entry in record.entries.values() {
                    println!(
                        "{:<14} {:<12} {:<5} {:>8} {:<16} {:<14} {:>8} {:<20}",
                        truncate(&record.source_position_id, 12),
                        truncate(&record.source.symbol, 10),
                        record.source.direction.as_str(),
                        record.source.volume,
                        truncate(&entry.account_id, 14),
                        format!("{}{}", entry.status, archived),
                        entry.attempt_count,
                        entry.order_id.as_deref().unwrap_or("-"),
                    );
                    if let Some(error) = &entry.last_error {
                        println!("{:>16}last error: {}", "", error);
                    }
                }
            }
        }

        Commands::Resolve {
            position,
            account,
            order_id,
            failed,
            closed,
            reason,
        } => {
            let resolution = match (order_id, failed, closed) {
                (Some(id), false, false) => Resolution::Opened(id),
                (None, true, false) => Resolution::Failed,
                (None, false, true) => Resolution::Closed,
                _ => bail!("Exactly one of --order-id, --failed or --closed is required"),
            };

            let db = Database::new(&config.database_url).await?;
            let repo: Arc<dyn RecordRepository> = Arc::new(db);
            let store = ReplicationStore::rehydrate(repo)
                .await
                .context("Failed to load replication state")?;

            let record = store
                .get(&position)
                .ok_or_else(|| anyhow::anyhow!("No live record for position {}", position))?;
            let entry = record
                .entry(&account)
                .ok_or_else(|| anyhow::anyhow!("Position {} has no entry for {}", position, account))?;

            let outcome = resolution_outcome(entry.status, resolution, reason)?;
            let updated = store.record_outcome(&position, &account, outcome, 0).await?;
            store.flush().await.context("Failed to persist resolution")?;

            info!(position = %position, account = %account, status = %updated.status, "Entry resolved");
            println!("{} on {} is now {}", position, account, updated.status);
        }
    }

    Ok(())
}

/// Map an operator resolution onto the transition it stands for.
fn resolution_outcome(
    status: EntryStatus,
    resolution: Resolution,
    reason: Option<String>,
) -> Result<Outcome> {
    let reason = reason.unwrap_or_else(|| "resolved manually".to_string());

    let outcome = match (status, resolution) {
        (EntryStatus::Pending, Resolution::Opened(order_id)) => Outcome::Opened { order_id },
        (EntryStatus::Pending, Resolution::Failed) => Outcome::OpenFailed { reason },
        (EntryStatus::ClosePending, Resolution::Closed) => Outcome::Closed,
        (EntryStatus::ClosePending, Resolution::Failed) => Outcome::CloseFailed { reason },
        (status, resolution) => {
            bail!("A {} entry cannot be resolved as {:?}", status, resolution)
        }
    };
    Ok(outcome)
}

fn print_config(config: &ReplicatorConfig) -> Result<()> {
    let notifier = FanoutNotifier::from_config(&config.notifications)?;

    println!("\n=== Replicator Configuration ===\n");
    println!("Source:");
    println!("  Bridge URL:           {}", config.source.bridge_url);
    println!("  Timeout:              {}ms", config.source.timeout_ms);
    println!("  Poll Interval:        {}ms", config.poll_interval_ms);

    println!("\nDestinations:");
    for dest in &config.destinations {
        println!(
            "  {:<20} {:?} @ {} (account {})",
            dest.account_id, dest.platform, dest.base_url, dest.account_number
        );
    }

    println!("\nSymbols:");
    let mut overrides: Vec<_> = config.symbols.overrides.iter().collect();
    overrides.sort();
    for (raw, mapped) in overrides {
        println!("  {} -> {}", raw, mapped);
    }
    println!("  Suffixes:             {}", config.symbols.suffixes.join(", "));
    if config.symbols.allowed.is_empty() {
        println!("  Allowed:              any");
    } else {
        let mut allowed: Vec<_> = config.symbols.allowed.iter().map(String::as_str).collect();
        allowed.sort_unstable();
        println!("  Allowed:              {}", allowed.join(", "));
    }

    println!("\nLots:");
    println!("  Mode:                 {}", config.lots.mode);
    println!("  Multiplier:           {}", config.lots.multiplier);
    println!("  Range:                {} - {}", config.lots.min_lot, config.lots.max_lot);
    println!("  Precision:            {} dp", config.lots.precision);
    println!("  Copy SL/TP:           {}", config.copy_stop_take_profit);

    println!("\nRetry:");
    println!("  Max Attempts:         {}", config.retry.max_attempts);
    println!(
        "  Backoff:              {}ms doubling to {}ms (+{:.0}% jitter)",
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.retry.jitter_fraction * 100.0
    );
    println!("  Call Timeout:         {}ms", config.retry.call_timeout_ms);

    println!("\nCircuit Breaker:");
    println!("  Failure Threshold:    {}", config.circuit_breaker.failure_threshold);
    println!("  Cooldown:             {}s", config.circuit_breaker.cooldown_secs);

    println!("\nState:");
    println!("  Database:             {}", config.database_url);
    println!("  Staleness Threshold:  {}s", config.staleness_threshold_secs);
    println!("  Notification Sinks:   {}", notifier.sink_count());

    println!("\nConfiguration OK.");
    Ok(())
}

/// Truncate string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
