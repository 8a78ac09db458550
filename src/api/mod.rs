//! Source and destination clients consumed by the replication engine.

mod destination;
mod error;
mod match_trader;
mod source_client;
mod types;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{DestinationConfig, Platform};

pub use destination::DestinationClient;
pub use error::{DestinationError, SourceError};
pub use match_trader::MatchTraderClient;
pub use source_client::{HttpSourceClient, SourceClient};

/// Build the client for a destination account from its platform tag.
pub fn build_destination(config: &DestinationConfig) -> Result<Arc<dyn DestinationClient>> {
    match config.platform {
        Platform::MatchTrader => Ok(Arc::new(MatchTraderClient::new(config.clone())?)),
    }
}
