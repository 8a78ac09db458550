//! Destination account capability, implemented once per platform.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::TranslatedOrder;

use super::error::DestinationError;

/// Operations the replication engine needs from a destination account.
///
/// Every call is bounded by the implementation's own timeout; the retry
/// manager adds a second bound on top.
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Account id this client trades on (matches the config entry).
    fn account_id(&self) -> &str;

    async fn authenticate(&self) -> Result<(), DestinationError>;

    /// Place a market order, returning the destination's order/position id.
    async fn open_order(&self, order: &TranslatedOrder) -> Result<String, DestinationError>;

    async fn close_order(&self, order_id: &str) -> Result<(), DestinationError>;

    async fn modify_order(
        &self,
        order_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), DestinationError>;
}
