//! Execution runtime: the engine loop and the run coordinator.
//!
//! [`Engine`] owns the traversal algorithm; [`RunCoordinator`] owns
//! everything around it: run records, background scheduling, cancellation,
//! event publication, and stream lifecycle. The two communicate through the
//! [`ExecutionObserver`] tap.

pub mod coordinator;
pub mod engine;
pub mod observer;

pub use coordinator::{CoordinatorConfig, CoordinatorError, RunCoordinator, RunRequest};
pub use engine::{Engine, EngineError, EngineOptions, EngineReport, DEFAULT_MAX_ITERATIONS};
pub use observer::{ExecutionObserver, NoopObserver, ObserverError};
