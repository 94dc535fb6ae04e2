//! End-to-end workflow scenarios driven through the coordinator, from a
//! serialized definition all the way to persisted run records and log rows.

mod common;
use common::*;

use serde_json::{json, Value};

use flowgraph::graphs::{EdgeDefinition, GraphDefinition, NodeDefinition};
use flowgraph::repository::Repository;
use flowgraph::runtimes::RunRequest;
use flowgraph::types::{NodeStatus, RunStatus};

fn definition(
    name: &str,
    nodes: &[(&str, &str)],
    edges: &[(&str, &str, Option<&str>)],
    entry: &str,
) -> GraphDefinition {
    GraphDefinition {
        name: name.to_string(),
        description: None,
        nodes: nodes
            .iter()
            .map(|(node, tool)| NodeDefinition {
                name: node.to_string(),
                tool: tool.to_string(),
            })
            .collect(),
        edges: edges
            .iter()
            .map(|(from, to, condition)| EdgeDefinition {
                from_node: from.to_string(),
                to_node: to.to_string(),
                condition: condition.map(str::to_string),
            })
            .collect(),
        entry_point: entry.to_string(),
    }
}

fn data_count(state: &Value) -> Option<i64> {
    state.get("data")?.get("count")?.as_i64()
}

#[tokio::test]
async fn two_step_linear_pipeline() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "linear",
            &[("a", "reset_count"), ("b", "increment_count")],
            &[("a", "b", None)],
            "a",
        ))
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("linear"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.run_id.starts_with("run_"));

    let finished = wait_for_terminal(&repository, &run.run_id).await;
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(data_count(finished.final_state.as_ref().unwrap()), Some(2));
    assert_eq!(finished.total_iterations, Some(2));
    assert!(finished.error_message.is_none());
    assert!(finished.started_at.unwrap() <= finished.completed_at.unwrap());

    let logs = repository.logs_for_run(&run.run_id).await.unwrap();
    let completed: Vec<&str> = logs
        .iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .map(|l| l.node_name.as_str())
        .collect();
    assert_eq!(completed, vec!["a", "b"]);
}

#[tokio::test]
async fn conditional_branching_routes_by_value() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "branching",
            &[("a", "passthrough"), ("b", "tag_high"), ("c", "tag_low")],
            &[
                ("a", "b", Some("value_above_5")),
                ("a", "c", Some("value_at_most_5")),
            ],
            "a",
        ))
        .await
        .unwrap();

    let high = coordinator
        .start_run(RunRequest::new("branching").data("value", json!(10)))
        .await
        .unwrap();
    let finished = wait_for_terminal(&repository, &high.run_id).await;
    assert_eq!(finished.status, RunStatus::Completed);
    let state = finished.final_state.unwrap();
    assert_eq!(state["data"]["path"], json!("high"));

    let completed: Vec<String> = repository
        .logs_for_run(&high.run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .map(|l| l.node_name)
        .collect();
    assert_eq!(completed, vec!["a", "b"]);

    let low = coordinator
        .start_run(RunRequest::new("branching").data("value", json!(3)))
        .await
        .unwrap();
    let finished = wait_for_terminal(&repository, &low.run_id).await;
    let state = finished.final_state.unwrap();
    assert_eq!(state["data"]["path"], json!("low"));

    let completed: Vec<String> = repository
        .logs_for_run(&low.run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .map(|l| l.node_name)
        .collect();
    assert_eq!(completed, vec!["a", "c"]);
}

#[tokio::test]
async fn bounded_loop_runs_until_condition_goes_false() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "loop",
            &[("a", "increment_count"), ("b", "passthrough")],
            &[("a", "b", Some("count_below_3")), ("b", "a", None)],
            "a",
        ))
        .await
        .unwrap();

    let run = coordinator.start_run(RunRequest::new("loop")).await.unwrap();
    let finished = wait_for_terminal(&repository, &run.run_id).await;

    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(data_count(finished.final_state.as_ref().unwrap()), Some(3));

    let completed: Vec<String> = repository
        .logs_for_run(&run.run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .map(|l| l.node_name)
        .collect();
    assert_eq!(completed, vec!["a", "b", "a", "b", "a"]);
    assert_eq!(finished.total_iterations, Some(5));
}

#[tokio::test]
async fn infinite_loop_is_stopped_by_iteration_bound() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "spinner",
            &[("x", "passthrough")],
            &[("x", "x", Some("always"))],
            "x",
        ))
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("spinner").max_iterations(5))
        .await
        .unwrap();
    let finished = wait_for_terminal(&repository, &run.run_id).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished
        .error_message
        .as_deref()
        .unwrap()
        .contains("max iterations"));

    let logs = repository.logs_for_run(&run.run_id).await.unwrap();
    let completed = logs
        .iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .count();
    assert_eq!(completed, 5);
    // No sixth node execution was even started.
    let started = logs
        .iter()
        .filter(|l| l.status == NodeStatus::Started)
        .count();
    assert_eq!(started, 5);
}

#[tokio::test]
async fn node_failure_fails_run_and_preserves_partial_progress() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "fragile",
            &[("a", "reset_count"), ("b", "explode")],
            &[("a", "b", None)],
            "a",
        ))
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("fragile"))
        .await
        .unwrap();
    let finished = wait_for_terminal(&repository, &run.run_id).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished.error_message.is_some());

    let final_state = finished.final_state.unwrap();
    // Progress from the successful node survives the failure.
    assert_eq!(data_count(&final_state), Some(1));
    let errors = final_state["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_str().unwrap().contains("b"));

    let logs = repository.logs_for_run(&run.run_id).await.unwrap();
    let outcomes: Vec<(&str, NodeStatus)> = logs
        .iter()
        .filter(|l| l.status != NodeStatus::Started)
        .map(|l| (l.node_name.as_str(), l.status))
        .collect();
    assert_eq!(
        outcomes,
        vec![("a", NodeStatus::Completed), ("b", NodeStatus::Failed)]
    );
    assert!(logs
        .iter()
        .find(|l| l.status == NodeStatus::Failed)
        .unwrap()
        .error_message
        .is_some());
}

#[tokio::test]
async fn late_subscriber_gets_one_synthesized_terminal_frame() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "quick",
            &[("only", "reset_count")],
            &[],
            "only",
        ))
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("quick"))
        .await
        .unwrap();
    wait_for_terminal(&repository, &run.run_id).await;

    let mut stream = coordinator.subscribe(&run.run_id).await.unwrap();
    let frame = stream.recv().await.unwrap();
    match frame {
        flowgraph::event_bus::RunEvent::WorkflowCompleted {
            run_id,
            status,
            final_state,
            total_iterations,
            ..
        } => {
            assert_eq!(run_id, run.run_id);
            assert_eq!(status, RunStatus::Completed);
            assert_eq!(data_count(&final_state), Some(1));
            assert_eq!(total_iterations, 1);
        }
        other => panic!("expected workflow_completed, got {other:?}"),
    }
    assert_eq!(stream.recv().await, None);
}

#[tokio::test]
async fn log_iterations_are_contiguous_and_totals_match() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "loop",
            &[("a", "increment_count"), ("b", "passthrough")],
            &[("a", "b", Some("count_below_3")), ("b", "a", None)],
            "a",
        ))
        .await
        .unwrap();

    let run = coordinator.start_run(RunRequest::new("loop")).await.unwrap();
    let finished = wait_for_terminal(&repository, &run.run_id).await;

    let logs = repository.logs_for_run(&run.run_id).await.unwrap();
    let executed: Vec<u32> = logs
        .iter()
        .filter(|l| l.status != NodeStatus::Started)
        .map(|l| l.iteration)
        .collect();
    let expected: Vec<u32> = (0..executed.len() as u32).collect();
    assert_eq!(executed, expected);

    let completed = logs
        .iter()
        .filter(|l| l.status == NodeStatus::Completed)
        .count() as u32;
    let failed = logs
        .iter()
        .filter(|l| l.status == NodeStatus::Failed)
        .count() as u32;
    assert_eq!(finished.total_iterations, Some(completed + failed));

    // Every non-started row records its execution time.
    assert!(logs
        .iter()
        .filter(|l| l.status != NodeStatus::Started)
        .all(|l| l.execution_time_ms.is_some()));
}

#[tokio::test]
async fn final_state_round_trips_through_persistence() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(definition(
            "linear",
            &[("a", "reset_count"), ("b", "increment_count")],
            &[("a", "b", None)],
            "a",
        ))
        .await
        .unwrap();

    let run = coordinator
        .start_run(
            RunRequest::new("linear")
                .data("note", json!("keep me"))
                .config("quality_threshold", json!(0.8)),
        )
        .await
        .unwrap();
    let finished = wait_for_terminal(&repository, &run.run_id).await;

    let state =
        flowgraph::state::WorkflowState::from_value(finished.final_state.unwrap()).unwrap();
    assert_eq!(state.workflow_id, "linear");
    assert_eq!(state.run_id, run.run_id);
    assert_eq!(state.get_data("note"), Some(&json!("keep me")));
    assert_eq!(state.get_config("quality_threshold"), Some(&json!(0.8)));
    assert_eq!(state.get_data("count"), Some(&json!(2)));
}
