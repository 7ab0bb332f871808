//! Stream modes of a run.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use braid_agent::{Agent, AgentInput, RunConfig, StreamEvent, StreamMode};
use braid_llm::{AiMessage, AiMessageChunk, MockModel, MockResponse, ToolCall};

use common::CalculatorTool;

fn tool_agent() -> Agent {
    let model = Arc::new(MockModel::with_messages(vec![
        AiMessage::with_tool_calls(
            "",
            vec![ToolCall::new("c1", "calculator", json!({"op": "mul", "a": 6, "b": 7}))],
        ),
        AiMessage::new("42"),
    ]));
    Agent::builder()
        .with_model(model)
        .with_tool(CalculatorTool::default())
        .build()
        .unwrap()
}

async fn collect(agent: &Agent, mode: StreamMode) -> Vec<StreamEvent> {
    agent
        .stream(AgentInput::text("6*7"), RunConfig::new(), mode)
        .map(|item| item.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_values_mode_yields_state_per_node() {
    let events = collect(&tool_agent(), StreamMode::Values).await;

    let sizes: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Values(state) => Some(state.messages.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![2, 3, 4]);
    assert!(matches!(events.last(), Some(StreamEvent::Done(output)) if output.text() == "42"));
}

#[tokio::test]
async fn test_updates_mode_labels_nodes() {
    let events = collect(&tool_agent(), StreamMode::Updates).await;

    let nodes: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Update { node, .. } => Some(node.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(nodes, vec!["model", "tools", "model"]);

    let StreamEvent::Update { patch, .. } = &events[1] else {
        panic!("expected an update");
    };
    assert_eq!(patch.messages.len(), 1);
}

#[tokio::test]
async fn test_messages_mode_streams_chunks() {
    let model = Arc::new(MockModel::new(vec![MockResponse::Chunks(vec![
        AiMessageChunk::text("Hel"),
        AiMessageChunk::text("lo"),
    ])]));
    let agent = Agent::builder().with_model(model).build().unwrap();

    let events = collect(&agent, StreamMode::Messages).await;

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::MessageChunk(chunk) => Some(chunk.base.content.text()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello");
    let Some(StreamEvent::Done(output)) = events.last() else {
        panic!("expected the run to finish");
    };
    assert_eq!(output.text(), "Hello");
}

#[tokio::test]
async fn test_failure_ends_stream_with_error() {
    let agent = Agent::builder()
        .with_model(Arc::new(MockModel::new(Vec::new())))
        .build()
        .unwrap();

    let items: Vec<_> = agent
        .stream(AgentInput::text("hi"), RunConfig::new(), StreamMode::Values)
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    let failure = items[0].as_ref().unwrap_err();
    assert_eq!(failure.state.messages.len(), 1);
}
