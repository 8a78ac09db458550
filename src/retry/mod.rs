//! Retry and failure isolation for destination operations.

mod breaker;
mod manager;

pub use breaker::BreakerState;
pub use manager::{BreakerSnapshot, DispatchFailure, RetryManager};
