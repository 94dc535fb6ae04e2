//! Workflow state: the value that flows node to node.
//!
//! [`WorkflowState`] is a typed record with an open JSON payload. The typed
//! part carries identity (`workflow_id`, `run_id`), the engine-maintained
//! iteration counter, and accumulated errors/warnings; the open part is the
//! `data` map nodes read and write, plus a `config` map of execution hints
//! supplied at run start.
//!
//! State follows immutable-update semantics: every mutator consumes `self`
//! and returns a new logical state, so a tool can never observe another
//! tool's half-applied changes. Serialization round-trips all fields
//! losslessly through JSON.
//!
//! # Examples
//!
//! ```rust
//! use flowgraph::state::WorkflowState;
//! use serde_json::json;
//!
//! let state = WorkflowState::new("pipeline", "run_abc123")
//!     .set_data("count", json!(1))
//!     .add_warning("input truncated");
//!
//! assert_eq!(state.get_data("count"), Some(&json!(1)));
//! assert!(state.has_warnings());
//! assert!(!state.has_errors());
//!
//! // Lossless JSON round-trip
//! let value = state.to_value().unwrap();
//! let back = WorkflowState::from_value(value).unwrap();
//! assert_eq!(state, back);
//! ```

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced when encoding or decoding a state.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// JSON (de)serialization failed.
    #[error("state serialization failed: {source}")]
    #[diagnostic(
        code(flowgraph::state::serde),
        help("The state payload must be JSON-serializable.")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

/// The value carried between nodes during a run.
///
/// Conceptually immutable: mutators consume `self` and return the updated
/// state. Node tools receive a state by value and return a new one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Identity of the graph definition this run executes.
    pub workflow_id: String,
    /// Identity of this particular run.
    pub run_id: String,
    /// Creation time of this state value.
    pub timestamp: DateTime<Utc>,
    /// Engine-maintained traversal counter; bumped once per executed node.
    #[serde(default)]
    pub iteration: u32,
    /// Open payload read and written by tools.
    #[serde(default)]
    pub data: FxHashMap<String, Value>,
    /// Node-reported failures that did not abort the run.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Non-fatal observations.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Execution hints supplied at run start (quality thresholds, flags).
    #[serde(default)]
    pub config: FxHashMap<String, Value>,
}

impl WorkflowState {
    /// Create a fresh state for the given workflow and run identities.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            timestamp: Utc::now(),
            iteration: 0,
            data: FxHashMap::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            config: FxHashMap::default(),
        }
    }

    /// Start building a state with a fluent API.
    #[must_use]
    pub fn builder(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> WorkflowStateBuilder {
        WorkflowStateBuilder {
            state: Self::new(workflow_id, run_id),
        }
    }

    /// Read a value from the open payload.
    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set a single key in the open payload, returning the updated state.
    #[must_use]
    pub fn set_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Merge several keys into the open payload at once. Later keys win.
    #[must_use]
    pub fn merge_data(mut self, entries: FxHashMap<String, Value>) -> Self {
        self.data.extend(entries);
        self
    }

    /// Read a config hint.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Append a node-reported error, returning the updated state.
    #[must_use]
    pub fn add_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Append a warning, returning the updated state.
    #[must_use]
    pub fn add_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Drop all accumulated errors.
    #[must_use]
    pub fn clear_errors(mut self) -> Self {
        self.errors.clear();
        self
    }

    /// Stamp the engine's iteration counter onto the state.
    #[must_use]
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Whether any node has reported an error on this run.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether any warnings have accumulated.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Encode the state as a JSON value.
    pub fn to_value(&self) -> Result<Value, StateError> {
        serde_json::to_value(self).map_err(|source| StateError::Serde { source })
    }

    /// Decode a state from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        serde_json::from_value(value).map_err(|source| StateError::Serde { source })
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorkflowState(workflow={}, run={}, iteration={}, errors={}, warnings={})",
            self.workflow_id,
            self.run_id,
            self.iteration,
            self.errors.len(),
            self.warnings.len()
        )
    }
}

/// Fluent constructor for [`WorkflowState`].
///
/// Useful for seeding complex initial states in tests or when translating
/// an incoming run request into a state.
///
/// # Examples
///
/// ```rust
/// use flowgraph::state::WorkflowState;
/// use serde_json::json;
///
/// let state = WorkflowState::builder("review", "run_1")
///     .data("source", json!("fn main() {}"))
///     .config("quality_threshold", json!(0.8))
///     .build();
///
/// assert_eq!(state.get_config("quality_threshold"), Some(&json!(0.8)));
/// ```
#[derive(Debug)]
pub struct WorkflowStateBuilder {
    state: WorkflowState,
}

impl WorkflowStateBuilder {
    /// Add one payload entry.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.data.insert(key.into(), value);
        self
    }

    /// Merge a whole payload map.
    #[must_use]
    pub fn data_map(mut self, entries: FxHashMap<String, Value>) -> Self {
        self.state.data.extend(entries);
        self
    }

    /// Add one config hint.
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.config.insert(key.into(), value);
        self
    }

    /// Merge a whole config map.
    #[must_use]
    pub fn config_map(mut self, entries: FxHashMap<String, Value>) -> Self {
        self.state.config.extend(entries);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> WorkflowState {
        self.state
    }
}
