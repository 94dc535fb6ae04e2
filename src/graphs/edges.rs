//! Edges, routing conditions, and the per-source edge index.
//!
//! An edge is a directed transition between two named nodes, optionally
//! guarded by a condition over the state. The [`EdgeManager`] indexes edges
//! by source node and resolves the next node for the engine: edges are
//! evaluated in insertion order and the first unguarded edge, or the first
//! edge whose condition holds, wins. When nothing matches, the current node
//! is terminal.
//!
//! Callers who want fallthrough behavior register their unconditional
//! default edge last.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::state::WorkflowState;

/// A condition evaluation failed. Routing cannot proceed, so the engine
/// aborts the run.
#[derive(Debug, Error, Diagnostic)]
#[error("edge condition failed on '{from}' -> '{to}': {message}")]
#[diagnostic(
    code(flowgraph::edge::condition),
    help("Conditions must be total over the states the workflow can produce.")
)]
pub struct EdgeConditionError {
    /// Source node of the offending edge.
    pub from: String,
    /// Target node of the offending edge.
    pub to: String,
    /// What the condition reported.
    pub message: String,
}

/// Failure raised inside a condition body.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConditionError {
    /// Human-readable cause.
    pub message: String,
}

impl ConditionError {
    /// Build a condition failure from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A routing predicate over the workflow state.
///
/// Conditions are pure functions of the state; they may suspend (repository
/// lookups, remote feature flags) but must not mutate anything observable.
#[async_trait]
pub trait EdgeCondition: Send + Sync {
    /// Decide whether the guarded edge should be traversed.
    async fn evaluate(&self, state: &WorkflowState) -> Result<bool, ConditionError>;
}

impl std::fmt::Debug for dyn EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn EdgeCondition")
    }
}

struct ConditionFn<F> {
    func: F,
}

#[async_trait]
impl<F> EdgeCondition for ConditionFn<F>
where
    F: Fn(&WorkflowState) -> bool + Send + Sync,
{
    async fn evaluate(&self, state: &WorkflowState) -> Result<bool, ConditionError> {
        Ok((self.func)(state))
    }
}

/// Wrap a synchronous closure as an [`EdgeCondition`].
pub fn condition_fn<F>(func: F) -> Arc<dyn EdgeCondition>
where
    F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
{
    Arc::new(ConditionFn { func })
}

/// Stock conditions for common routing shapes.
///
/// These mirror the predicates most workflows end up writing by hand:
/// key presence, equality, and numeric threshold checks against the open
/// `data` payload, plus error-state gates.
pub mod conditions {
    use super::*;

    /// Always traverse. Equivalent to an unguarded edge; useful when a
    /// serialized definition wants the condition slot filled explicitly.
    pub fn always() -> Arc<dyn EdgeCondition> {
        condition_fn(|_| true)
    }

    /// Never traverse; disables an edge without removing it.
    pub fn never() -> Arc<dyn EdgeCondition> {
        condition_fn(|_| false)
    }

    /// Holds when `data` contains `key`.
    pub fn has_data_key(key: impl Into<String>) -> Arc<dyn EdgeCondition> {
        let key = key.into();
        condition_fn(move |state| state.data.contains_key(&key))
    }

    /// Holds when `data[key]` equals `expected`.
    pub fn data_value_equals(key: impl Into<String>, expected: Value) -> Arc<dyn EdgeCondition> {
        let key = key.into();
        condition_fn(move |state| state.get_data(&key) == Some(&expected))
    }

    /// Holds when `data[key]` is a number strictly greater than `threshold`.
    /// A missing or non-numeric value does not hold.
    pub fn data_number_greater_than(
        key: impl Into<String>,
        threshold: f64,
    ) -> Arc<dyn EdgeCondition> {
        let key = key.into();
        condition_fn(move |state| {
            state
                .get_data(&key)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > threshold)
        })
    }

    /// Holds when `data[key]` is a number strictly less than `threshold`.
    /// A missing or non-numeric value does not hold.
    pub fn data_number_less_than(
        key: impl Into<String>,
        threshold: f64,
    ) -> Arc<dyn EdgeCondition> {
        let key = key.into();
        condition_fn(move |state| {
            state
                .get_data(&key)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < threshold)
        })
    }

    /// Holds when the state carries no errors.
    pub fn has_no_errors() -> Arc<dyn EdgeCondition> {
        condition_fn(|state| !state.has_errors())
    }

    /// Holds when the state carries at least one error.
    pub fn has_errors() -> Arc<dyn EdgeCondition> {
        condition_fn(|state| state.has_errors())
    }
}

/// A directed transition between two named nodes.
#[derive(Clone)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// Optional guard; `None` means the edge is unconditional.
    pub condition: Option<Arc<dyn EdgeCondition>>,
}

impl Edge {
    /// An unconditional edge.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// A guarded edge.
    #[must_use]
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Arc<dyn EdgeCondition>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }

    /// Whether the edge carries a condition.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Whether the edge is a self-loop.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Edge({} -> {}{})",
            self.from,
            self.to,
            if self.is_conditional() {
                ", conditional"
            } else {
                ""
            }
        )
    }
}

/// Edge collection indexed by source node for O(1) outgoing lookups.
///
/// Per-source order is insertion order, which is authoritative for routing
/// tie-breaks.
#[derive(Clone, Debug, Default)]
pub struct EdgeManager {
    edges: Vec<Edge>,
    outgoing: FxHashMap<String, Vec<usize>>,
}

impl EdgeManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an edge, keeping the per-source order.
    pub fn add(&mut self, edge: Edge) {
        let index = self.edges.len();
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .push(index);
        self.edges.push(edge);
    }

    /// All edges in insertion order.
    #[must_use]
    pub fn all(&self) -> &[Edge] {
        &self.edges
    }

    /// Total edge count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the manager holds no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Ordered outgoing edges of `node`.
    pub fn outgoing(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Whether `node` has any outgoing edge.
    #[must_use]
    pub fn has_outgoing(&self, node: &str) -> bool {
        self.outgoing.get(node).is_some_and(|v| !v.is_empty())
    }

    /// Resolve the next node from `current` given `state`.
    ///
    /// Edges are tried in insertion order: an unguarded edge is selected
    /// immediately; a guarded edge is selected when its condition holds.
    /// `Ok(None)` means `current` is terminal for this state. A raising
    /// condition surfaces as [`EdgeConditionError`].
    pub async fn next_node(
        &self,
        current: &str,
        state: &WorkflowState,
    ) -> Result<Option<&str>, EdgeConditionError> {
        for edge in self.outgoing(current) {
            match &edge.condition {
                None => return Ok(Some(edge.to.as_str())),
                Some(condition) => match condition.evaluate(state).await {
                    Ok(true) => return Ok(Some(edge.to.as_str())),
                    Ok(false) => continue,
                    Err(err) => {
                        return Err(EdgeConditionError {
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                            message: err.message,
                        })
                    }
                },
            }
        }
        Ok(None)
    }
}
