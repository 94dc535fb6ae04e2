//! Run event frames and the in-memory per-run broker.

pub mod broker;
pub mod event;

pub use broker::{EventBroker, RunEventStream, DEFAULT_CHANNEL_CAPACITY};
pub use event::RunEvent;
