//! Data models for source positions, translated orders and replication records.

mod order;
mod position;
mod record;

pub use order::TranslatedOrder;
pub use position::{Direction, SourcePosition};
pub use record::{DestinationEntry, EntryStatus, Outcome, ReplicationRecord, TransitionError};
