#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use flowgraph::event_bus::EventBroker;
use flowgraph::graphs::edges::conditions;
use flowgraph::node::{tool_fn, Tool, ToolError, ToolMetadata};
use flowgraph::registry::{ConditionRegistry, ToolRegistry};
use flowgraph::repository::{MemoryRepository, Repository, RunRecord};
use flowgraph::runtimes::{CoordinatorConfig, RunCoordinator};
use flowgraph::state::WorkflowState;

/// Tool that sets `data[key] = 1`.
pub fn reset_counter(key: &'static str) -> Arc<dyn Tool> {
    tool_fn(move |state: WorkflowState| async move { Ok(state.set_data(key, json!(1))) })
}

/// Tool that increments `data[key]`, treating a missing key as zero.
pub fn increment(key: &'static str) -> Arc<dyn Tool> {
    tool_fn(move |state: WorkflowState| async move {
        let current = state.get_data(key).and_then(Value::as_i64).unwrap_or(0);
        Ok(state.set_data(key, json!(current + 1)))
    })
}

/// Tool that sets `data[key] = label`.
pub fn tag(key: &'static str, label: &'static str) -> Arc<dyn Tool> {
    tool_fn(move |state: WorkflowState| async move { Ok(state.set_data(key, json!(label))) })
}

/// Tool that returns the state unchanged.
pub fn passthrough() -> Arc<dyn Tool> {
    tool_fn(|state| async move { Ok(state) })
}

/// Tool that always raises.
pub fn failing(message: &'static str) -> Arc<dyn Tool> {
    tool_fn(move |_: WorkflowState| async move {
        Err::<WorkflowState, _>(ToolError::failed(message))
    })
}

/// Tool that sleeps before passing the state through.
pub fn slow(delay: Duration) -> Arc<dyn Tool> {
    tool_fn(move |state: WorkflowState| async move {
        sleep(delay).await;
        Ok(state)
    })
}

/// The tool set the integration workflows reference by name.
pub fn standard_tools() -> ToolRegistry {
    ToolRegistry::builder()
        .register(
            "reset_count",
            reset_counter("count"),
            ToolMetadata::described("sets count to 1"),
        )
        .unwrap()
        .register(
            "increment_count",
            increment("count"),
            ToolMetadata::described("increments count"),
        )
        .unwrap()
        .register(
            "tag_high",
            tag("path", "high"),
            ToolMetadata::described("marks the high path"),
        )
        .unwrap()
        .register(
            "tag_low",
            tag("path", "low"),
            ToolMetadata::described("marks the low path"),
        )
        .unwrap()
        .register("passthrough", passthrough(), ToolMetadata::default())
        .unwrap()
        .register(
            "explode",
            failing("deliberate failure"),
            ToolMetadata::described("always raises"),
        )
        .unwrap()
        .register(
            "slow_50ms",
            slow(Duration::from_millis(50)),
            ToolMetadata::described("sleeps 50ms"),
        )
        .unwrap()
        .build()
}

/// The condition set the integration workflows reference by name.
pub fn standard_conditions() -> ConditionRegistry {
    ConditionRegistry::builder()
        .register("always", conditions::always())
        .unwrap()
        .register("count_below_3", conditions::data_number_less_than("count", 3.0))
        .unwrap()
        .register("value_above_5", conditions::data_number_greater_than("value", 5.0))
        .unwrap()
        .register(
            "value_at_most_5",
            flowgraph::graphs::condition_fn(|s: &WorkflowState| {
                s.get_data("value")
                    .and_then(Value::as_f64)
                    .is_some_and(|v| v <= 5.0)
            }),
        )
        .unwrap()
        .build()
}

/// A coordinator wired to a fresh in-memory repository and broker.
pub fn test_coordinator() -> (Arc<RunCoordinator>, Arc<MemoryRepository>, Arc<EventBroker>) {
    test_coordinator_with(CoordinatorConfig::default())
}

/// Same as [`test_coordinator`] with explicit tuning.
pub fn test_coordinator_with(
    config: CoordinatorConfig,
) -> (Arc<RunCoordinator>, Arc<MemoryRepository>, Arc<EventBroker>) {
    let repository = Arc::new(MemoryRepository::new());
    let broker = Arc::new(EventBroker::default());
    let coordinator = Arc::new(RunCoordinator::new(
        standard_tools(),
        standard_conditions(),
        repository.clone(),
        broker.clone(),
        config,
    ));
    (coordinator, repository, broker)
}

/// Poll the repository until the run reaches a terminal status.
pub async fn wait_for_terminal(repository: &MemoryRepository, run_id: &str) -> RunRecord {
    for _ in 0..500 {
        if let Some(run) = repository.run_by_run_id(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal status in time");
}
