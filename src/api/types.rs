//! Wire types for the MT5 bridge and the Match-Trader REST API.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Direction, SourcePosition};

/// Position as exported by the MT5 bridge (mirrors `mt5.positions_get()`).
#[derive(Debug, Clone, Deserialize)]
pub struct BridgePosition {
    pub ticket: u64,
    pub symbol: String,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    pub position_type: u8,
    pub volume: Decimal,
    pub price_open: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    /// Open time, unix seconds
    pub time: i64,
}

impl BridgePosition {
    pub fn into_position(self) -> Option<SourcePosition> {
        let direction = match self.position_type {
            0 => Direction::Buy,
            1 => Direction::Sell,
            _ => return None,
        };

        // MT5 reports unset levels as 0.0
        let level = |v: Decimal| if v.is_zero() { None } else { Some(v) };

        Some(SourcePosition {
            position_id: self.ticket.to_string(),
            symbol: self.symbol,
            direction,
            volume: self.volume,
            open_price: self.price_open,
            stop_loss: level(self.sl),
            take_profit: level(self.tp),
            open_time: Utc
                .timestamp_opt(self.time, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Login request body.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub broker: &'a str,
}

/// Token refresh request body.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token lifetime assumed when the server omits or garbles `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Login and refresh response.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Trading account listed for the logged-in user.
#[derive(Debug, Clone, Deserialize)]
pub struct TradingAccount {
    pub id: String,
    pub account_number: String,
}

/// Market order request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderRequest {
    pub symbol: String,
    pub side: Direction,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub client_order_id: String,
}

/// Response to an accepted market order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderResponse {
    /// Position id the destination assigned
    pub position_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Stop/take-profit update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyPositionRequest {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}
