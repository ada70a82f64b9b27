//! Integration tests for the normalized stream contract — full round-trip
//! through a provider implementation without any network access.
//!
//! Every adapter promises the same canonical sequence; these tests pin the
//! parts the run engine depends on: exactly one terminal event, assembled
//! tool calls, and intent-probe recognition.

use std::sync::Arc;

use futures_util::StreamExt;

use strand_domain::stream::{FinishReason, StreamEvent};
use strand_providers::classifier;
use strand_providers::testing::{ScriptItem, ScriptedProvider};
use strand_providers::{Provider, ProviderRegistry, TurnRequest};

async fn collect(provider: &dyn Provider) -> Vec<StreamEvent> {
    let mut stream = provider.stream_turn(TurnRequest::default()).await.unwrap();
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        events.push(item.unwrap());
    }
    events
}

#[tokio::test]
async fn every_stream_has_exactly_one_terminal_event() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::text_turn("answer"),
        ScriptedProvider::tool_call_turn("tc_1", "web.search", "{}"),
        ScriptedProvider::empty_turn(),
    ]);

    for _ in 0..3 {
        let events = collect(&provider).await;
        let terminals = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Completed { .. }))
            .count();
        assert_eq!(terminals, 1);
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Completed { .. }
        ));
    }
}

#[tokio::test]
async fn tool_turns_finish_with_tool_calls_reason() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call_turn(
        "tc_9",
        "terminal.exec",
        r#"{"command":"ls"}"#,
    )]);
    let events = collect(&provider).await;

    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolCallDone { id, .. } if id == "tc_9"
    )));
    assert!(matches!(
        events.last().unwrap(),
        StreamEvent::Completed {
            finish_reason: FinishReason::ToolCalls,
            ..
        }
    ));
}

#[tokio::test]
async fn reference_errors_surface_typed_through_the_stream() {
    let provider = ScriptedProvider::new(vec![vec![ScriptItem::Error(
        "tool_call_id is not found: tc_ghost".into(),
    )]]);
    let mut stream = provider.stream_turn(TurnRequest::default()).await.unwrap();
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.is_tool_call_reference());
}

#[tokio::test]
async fn registry_resolution_plus_intent_probe() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ScriptedProvider::text_replies(&["social"])));

    let (provider, model) = registry.resolve(Some("scripted/fast-model")).unwrap();
    assert_eq!(model.as_deref(), Some("fast-model"));

    let intent = classifier::classify_intent(provider.as_ref(), "hey! how are you?", model)
        .await
        .unwrap();
    assert_eq!(intent, classifier::Intent::Social);
}

#[tokio::test]
async fn probe_requests_are_marked_for_adapters() {
    let provider = Arc::new(ScriptedProvider::text_replies(&["task"]));
    let _ = classifier::classify_intent(provider.as_ref(), "fix the build", None).await;

    let requests = provider.requests.lock();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].intent_probe);
    assert!(requests[0].tools.is_empty());
}
