//! Destination-side order produced by the translator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Order ready to be placed on a destination account.
///
/// Never persisted; recomputed from the source position on every attempt so
/// retries of the same logical event always carry identical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedOrder {
    /// Source position this order mirrors (used as the client order tag)
    pub source_position_id: String,

    pub destination_symbol: String,

    pub destination_volume: Decimal,

    pub direction: Direction,

    /// Present only when stop/take-profit copying is enabled
    pub stop_loss: Option<Decimal>,

    /// Present only when stop/take-profit copying is enabled
    pub take_profit: Option<Decimal>,
}

impl TranslatedOrder {
    /// Deterministic client tag so a destination can de-duplicate a resend.
    pub fn client_tag(&self) -> String {
        format!("rep-{}", self.source_position_id)
    }
}
