//! Replicator configuration, loaded once at startup and passed to components.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,

    pub destinations: Vec<DestinationConfig>,

    #[serde(default)]
    pub symbols: SymbolConfig,

    #[serde(default)]
    pub lots: LotConfig,

    /// Copy stop-loss/take-profit onto replicas and follow later changes
    #[serde(default = "default_true")]
    pub copy_stop_take_profit: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Source polling interval (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which an in-transit entry is reported for verification (seconds)
    #[serde(default = "default_staleness_secs")]
    pub staleness_threshold_secs: u64,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// MT5 bridge the source positions are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub bridge_url: String,

    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
}

/// Destination platform implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    MatchTrader,
}

/// One destination brokerage account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub account_id: String,

    pub platform: Platform,

    pub base_url: String,

    /// Broker / prop firm identifier on the platform
    pub broker_id: String,

    pub username: String,

    pub password: String,

    /// Trading account number selected after login
    pub account_number: String,
}

/// Symbol translation rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Explicit raw -> destination mappings; always win over suffix stripping
    #[serde(default)]
    pub overrides: HashMap<String, String>,

    /// Broker suffixes stripped from raw symbols (e.g. ".z")
    #[serde(default)]
    pub suffixes: Vec<String>,

    /// Destination symbols that may be traded; empty allows everything
    #[serde(default)]
    pub allowed: HashSet<String>,
}

/// How destination volume is derived from source volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotMode {
    /// source volume * multiplier
    Proportional,
    /// multiplier used as a constant lot size
    Fixed,
}

impl std::fmt::Display for LotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LotMode::Proportional => f.write_str("proportional"),
            LotMode::Fixed => f.write_str("fixed"),
        }
    }
}

/// Lot sizing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotConfig {
    pub mode: LotMode,

    /// Multiplier (proportional) or constant lot size (fixed)
    pub multiplier: Decimal,

    pub min_lot: Decimal,

    pub max_lot: Decimal,

    /// Decimal places destination volumes are rounded to
    #[serde(default = "default_lot_precision")]
    pub precision: u32,
}

impl Default for LotConfig {
    fn default() -> Self {
        Self {
            mode: LotMode::Proportional,
            multiplier: dec!(1.0),
            min_lot: dec!(0.01),
            max_lot: dec!(10.0),
            precision: default_lot_precision(),
        }
    }
}

/// Per-operation retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Attempts per execute call, including the first
    pub max_attempts: u32,

    /// Jitter added on top of each delay, as a fraction of it (0.0 to 1.0)
    pub jitter_fraction: f64,

    /// Upper bound on a single destination call
    pub call_timeout_ms: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
            jitter_fraction: 0.25,
            call_timeout_ms: 10_000,
        }
    }
}

/// Per-account circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Time the breaker stays open before a trial call is allowed (seconds)
    pub cooldown_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        seconds(self.cooldown_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Where notifications go besides the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Slack-compatible incoming webhook
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_staleness_secs() -> u64 {
    300
}

fn default_source_timeout_ms() -> u64 {
    5_000
}

fn default_lot_precision() -> u32 {
    2
}

fn default_database_url() -> String {
    "sqlite:./replicator.db?mode=rwc".to_string()
}

impl ReplicatorConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            bail!("At least one destination account must be configured");
        }

        let mut seen = HashSet::new();
        for dest in &self.destinations {
            if dest.account_id.trim().is_empty() {
                bail!("Destination account_id must not be empty");
            }
            if !seen.insert(dest.account_id.as_str()) {
                bail!("Duplicate destination account_id: {}", dest.account_id);
            }
        }

        if self.lots.min_lot <= Decimal::ZERO {
            bail!("lots.min_lot must be positive");
        }
        if self.lots.min_lot > self.lots.max_lot {
            bail!(
                "lots.min_lot ({}) exceeds lots.max_lot ({})",
                self.lots.min_lot,
                self.lots.max_lot
            );
        }
        if self.lots.multiplier <= Decimal::ZERO {
            bail!("lots.multiplier must be positive");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            bail!("retry.jitter_fraction must be within [0, 1]");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.cooldown_secs > MAX_WINDOW_SECS {
            bail!(
                "circuit_breaker.cooldown_secs must not exceed {}",
                MAX_WINDOW_SECS
            );
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        if self.staleness_threshold_secs > MAX_WINDOW_SECS {
            bail!("staleness_threshold_secs must not exceed {}", MAX_WINDOW_SECS);
        }

        Ok(())
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.account_id.clone()).collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        seconds(self.staleness_threshold_secs)
    }
}

/// Upper bound for second-valued windows (one year).
const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Saturates at `MAX_WINDOW_SECS` for configs that skipped `validate`.
fn seconds(secs: u64) -> chrono::Duration {
    chrono::TimeDelta::try_seconds(secs.min(MAX_WINDOW_SECS) as i64)
        .unwrap_or_else(|| chrono::TimeDelta::days(365))
}

#[cfg(test)]
pub(crate) fn sample_config() -> ReplicatorConfig {
    ReplicatorConfig {
        source: SourceConfig {
            bridge_url: "http://127.0.0.1:8765".to_string(),
            timeout_ms: 1_000,
        },
        destinations: ["e8-1", "ftmo-1"]
            .iter()
            .map(|id| DestinationConfig {
                account_id: id.to_string(),
                platform: Platform::MatchTrader,
                base_url: "https://mtr.example.com".to_string(),
                broker_id: "0".to_string(),
                username: "user@example.com".to_string(),
                password: "secret".to_string(),
                account_number: "100200".to_string(),
            })
            .collect(),
        symbols: SymbolConfig {
            overrides: HashMap::from([("XAUUSD".to_string(), "GOLD".to_string())]),
            suffixes: vec![".z".to_string()],
            allowed: HashSet::new(),
        },
        lots: LotConfig::default(),
        copy_stop_take_profit: true,
        retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 3,
            jitter_fraction: 0.0,
            call_timeout_ms: 1_000,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown_secs: 60,
        },
        poll_interval_ms: 10,
        staleness_threshold_secs: 300,
        database_url: "sqlite::memory:".to_string(),
        notifications: NotificationConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_json() {
        let raw = r#"{
            "source": { "bridge_url": "http://localhost:8765" },
            "destinations": [{
                "account_id": "e8-1",
                "platform": "match_trader",
                "base_url": "https://mtr.e8markets.com",
                "broker_id": "2",
                "username": "me@example.com",
                "password": "pw",
                "account_number": "700123"
            }],
            "lots": { "mode": "fixed", "multiplier": "0.5", "min_lot": "0.01", "max_lot": "10" }
        }"#;

        let config: ReplicatorConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.lots.mode, LotMode::Fixed);
        assert_eq!(config.lots.multiplier, dec!(0.5));
        assert_eq!(config.lots.precision, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.copy_stop_take_profit);
        assert_eq!(config.poll_interval(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = sample_config();
        config.destinations.push(config.destinations[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("Duplicate"));

        let mut config = sample_config();
        config.lots.min_lot = dec!(2);
        config.lots.max_lot = dec!(1);
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.retry.jitter_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.destinations.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_time_windows() {
        let mut config = sample_config();
        config.circuit_breaker.cooldown_secs = u64::MAX;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("cooldown_secs"));

        let mut config = sample_config();
        config.staleness_threshold_secs = u64::MAX;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("staleness_threshold_secs"));

        let mut config = sample_config();
        config.circuit_breaker.cooldown_secs = MAX_WINDOW_SECS;
        config.staleness_threshold_secs = MAX_WINDOW_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_windows_saturate_without_panicking() {
        let mut config = sample_config();
        config.circuit_breaker.cooldown_secs = u64::MAX;
        config.staleness_threshold_secs = u64::MAX;

        let year = chrono::Duration::seconds(MAX_WINDOW_SECS as i64);
        assert_eq!(config.circuit_breaker.cooldown(), year);
        assert_eq!(config.staleness_threshold(), year);
    }

    #[test]
    fn test_sample_is_valid() {
        sample_config().validate().unwrap();
    }
}
