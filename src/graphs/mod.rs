//! Graph model: nodes, edges, validation, and the serialized definition.
//!
//! The module splits along the lifecycle of a workflow shape:
//!
//! - [`definition`]: the wire/persisted form referencing tools by name
//! - [`builder`]: the executable in-process [`Graph`]
//! - [`edges`]: transitions and routing conditions
//! - [`validation`]: structural checks and advisory analysis

pub mod builder;
pub mod definition;
pub mod edges;
pub mod validation;

pub use builder::{Graph, GraphBuilder};
pub use definition::{EdgeDefinition, GraphBuildError, GraphDefinition, NodeDefinition};
pub use edges::{
    condition_fn, conditions, ConditionError, Edge, EdgeCondition, EdgeConditionError, EdgeManager,
};
pub use validation::{GraphStats, GraphValidationError};
