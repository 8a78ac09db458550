//! Source position model: one open trade on the terminal being mirrored.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position on the source terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Source-assigned id, unique while the position is open
    pub position_id: String,

    /// Raw source symbol, possibly carrying a broker suffix (e.g. "EURUSD.z")
    pub symbol: String,

    pub direction: Direction,

    /// Lot size
    pub volume: Decimal,

    pub open_price: Decimal,

    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    #[serde(default)]
    pub take_profit: Option<Decimal>,

    pub open_time: DateTime<Utc>,
}

impl SourcePosition {
    /// Whether a later observation of the same position changed anything a
    /// replica cares about. Symbol and direction never change while open.
    pub fn differs_from(&self, previous: &SourcePosition) -> bool {
        self.volume != previous.volume
            || self.stop_loss != previous.stop_loss
            || self.take_profit != previous.take_profit
    }

    /// Whether the stop-loss or take-profit moved.
    pub fn protection_changed(&self, previous: &SourcePosition) -> bool {
        self.stop_loss != previous.stop_loss || self.take_profit != previous.take_profit
    }
}
