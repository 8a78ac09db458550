//! Replication logic: source diffing, order translation and fan-out dispatch.

mod dispatcher;
mod observer;
mod translator;

pub use dispatcher::Dispatcher;
pub use observer::PositionObserver;
pub use translator::Translator;
