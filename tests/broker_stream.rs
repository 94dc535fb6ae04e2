//! Stream-facing behavior: wire shape of frames, lossy degradation with
//! repository fallback, and late-join synthesis for failed runs.

mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use flowgraph::event_bus::{EventBroker, RunEvent};
use flowgraph::graphs::{EdgeDefinition, GraphDefinition, NodeDefinition};
use flowgraph::repository::{MemoryRepository, Repository};
use flowgraph::runtimes::{CoordinatorConfig, RunCoordinator, RunRequest};
use flowgraph::types::RunStatus;

fn looping_definition(name: &str, node_tool: &str) -> GraphDefinition {
    GraphDefinition {
        name: name.to_string(),
        description: None,
        nodes: vec![
            NodeDefinition {
                name: "work".into(),
                tool: node_tool.into(),
            },
            NodeDefinition {
                name: "gate".into(),
                tool: "increment_count".into(),
            },
        ],
        edges: vec![
            EdgeDefinition {
                from_node: "work".into(),
                to_node: "gate".into(),
                condition: None,
            },
            EdgeDefinition {
                from_node: "gate".into(),
                to_node: "work".into(),
                condition: Some("count_below_3".into()),
            },
        ],
        entry_point: "work".into(),
    }
}

#[tokio::test]
async fn every_frame_serializes_with_type_and_timestamp() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(looping_definition("wired", "slow_50ms"))
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("wired"))
        .await
        .unwrap();
    let mut stream = coordinator.subscribe(&run.run_id).await.unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = stream.next_timeout(Duration::from_secs(5)).await {
        frames.push(frame);
    }
    wait_for_terminal(&repository, &run.run_id).await;

    assert!(!frames.is_empty());
    for frame in &frames {
        let value = serde_json::to_value(frame).unwrap();
        let kind = value["type"].as_str().unwrap();
        assert!(
            matches!(
                kind,
                "status_update"
                    | "node_completed"
                    | "workflow_completed"
                    | "progress_update"
                    | "log_entry"
                    | "error"
                    | "pong"
            ),
            "unexpected frame type {kind}"
        );
        assert!(value["timestamp"].is_string());
    }
    // The terminal frame is last.
    assert!(frames.last().unwrap().is_terminal());
    assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
}

#[tokio::test]
async fn lossy_subscriber_falls_back_to_repository_polling() {
    // A broker with a 2-frame buffer guarantees overruns for any real run.
    let repository = Arc::new(MemoryRepository::new());
    let broker = Arc::new(EventBroker::new(2));
    let coordinator = RunCoordinator::new(
        standard_tools(),
        standard_conditions(),
        repository.clone(),
        broker,
        CoordinatorConfig::default(),
    );

    // A slow first node leaves a comfortable window to subscribe while the
    // run is live; the loop after it then floods the 2-frame buffer.
    coordinator
        .create_graph(GraphDefinition {
            name: "chatty".into(),
            description: None,
            nodes: vec![
                NodeDefinition {
                    name: "warmup".into(),
                    tool: "slow_50ms".into(),
                },
                NodeDefinition {
                    name: "work".into(),
                    tool: "passthrough".into(),
                },
                NodeDefinition {
                    name: "gate".into(),
                    tool: "increment_count".into(),
                },
            ],
            edges: vec![
                EdgeDefinition {
                    from_node: "warmup".into(),
                    to_node: "work".into(),
                    condition: None,
                },
                EdgeDefinition {
                    from_node: "work".into(),
                    to_node: "gate".into(),
                    condition: None,
                },
                EdgeDefinition {
                    from_node: "gate".into(),
                    to_node: "work".into(),
                    condition: Some("count_below_3".into()),
                },
            ],
            entry_point: "warmup".into(),
        })
        .await
        .unwrap();
    let run = coordinator
        .start_run(RunRequest::new("chatty"))
        .await
        .unwrap();
    let mut stream = coordinator.subscribe(&run.run_id).await.unwrap();

    // Do not read until the run is long finished.
    let finished = wait_for_terminal(&repository, &run.run_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut received = 0;
    while stream.next_timeout(Duration::from_millis(200)).await.is_some() {
        received += 1;
    }
    assert!(stream.is_lossy(), "2-frame buffer cannot hold a whole run");
    assert!(received <= 2);

    // The canonical record is intact regardless of what the stream lost.
    assert_eq!(finished.status, RunStatus::Completed);
    let logs = repository.logs_for_run(&run.run_id).await.unwrap();
    assert!(logs.len() > 2);
}

#[tokio::test]
async fn late_join_on_failed_run_carries_error_details() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(GraphDefinition {
            name: "doomed".into(),
            description: None,
            nodes: vec![NodeDefinition {
                name: "boom".into(),
                tool: "explode".into(),
            }],
            edges: vec![],
            entry_point: "boom".into(),
        })
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("doomed"))
        .await
        .unwrap();
    wait_for_terminal(&repository, &run.run_id).await;

    let mut stream = coordinator.subscribe(&run.run_id).await.unwrap();
    match stream.recv().await.unwrap() {
        RunEvent::WorkflowCompleted {
            status,
            error_message,
            final_state,
            ..
        } => {
            assert_eq!(status, RunStatus::Failed);
            assert!(error_message.unwrap().contains("boom"));
            assert!(final_state != Value::Null);
        }
        other => panic!("expected workflow_completed, got {other:?}"),
    }
    assert_eq!(stream.recv().await, None);
}

#[tokio::test]
async fn error_frames_name_the_failing_node() {
    let (coordinator, repository, _broker) = test_coordinator();
    coordinator
        .create_graph(GraphDefinition {
            name: "fragile".into(),
            description: None,
            nodes: vec![
                NodeDefinition {
                    name: "ok".into(),
                    tool: "slow_50ms".into(),
                },
                NodeDefinition {
                    name: "boom".into(),
                    tool: "explode".into(),
                },
            ],
            edges: vec![EdgeDefinition {
                from_node: "ok".into(),
                to_node: "boom".into(),
                condition: None,
            }],
            entry_point: "ok".into(),
        })
        .await
        .unwrap();

    let run = coordinator
        .start_run(RunRequest::new("fragile"))
        .await
        .unwrap();
    let mut stream = coordinator.subscribe(&run.run_id).await.unwrap();

    let mut error_nodes = Vec::new();
    while let Some(frame) = stream.next_timeout(Duration::from_secs(5)).await {
        if let RunEvent::Error { node, message, .. } = frame {
            assert!(message.contains("deliberate"));
            error_nodes.push(node);
        }
    }
    wait_for_terminal(&repository, &run.run_id).await;
    assert_eq!(error_nodes, vec![Some("boom".to_string())]);
}

#[tokio::test]
async fn pong_frame_has_the_heartbeat_shape() {
    // The transport layer answers a literal `ping` with this frame.
    let frame = RunEvent::pong();
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "pong");
    assert!(value["timestamp"].is_string());
    assert!(frame.run_id().is_none());
}
