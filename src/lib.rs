//! ```text
//! GraphDefinition ──build(registries)──► Graph ──► Engine
//!        │                                           │
//!        │                                           ├─► ExecutionObserver
//!        │                                           │      │
//!   Repository ◄── RunCoordinator ◄──────────────────┘      ├─► Repository (logs)
//!        ▲                │                                 └─► EventBroker (frames)
//!        │                └─► subscribers (RunEventStream)
//! ```
//!
//! flowgraph is a workflow orchestration core: callers submit a directed
//! graph of named steps, the engine executes it against an evolving JSON
//! state, progress streams to subscribers per run, and every run persists
//! into queryable records.
//!
//! The crate is transport-agnostic. An HTTP/WebSocket layer is expected to
//! sit on top, translating [`runtimes::RunCoordinator`] calls and
//! [`event_bus::RunEvent`] frames into its own wire format.

pub mod config;
pub mod event_bus;
pub mod graphs;
pub mod node;
pub mod registry;
pub mod repository;
pub mod runtimes;
pub mod state;
pub mod types;
pub mod utils;
