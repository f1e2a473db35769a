// 轮次流端到端验证：文本回放一致性、过滤、取消、重新生成与并发拒绝。
mod common;

use atelier_server::schemas::{StreamEvent, TurnRequest};
use atelier_server::title::DEFAULT_CHAT_TITLE;
use common::*;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio_stream::StreamExt;

fn turn(chat_id: &str, content: &str) -> TurnRequest {
    TurnRequest {
        chat_id: chat_id.to_string(),
        user_id: "user_a".to_string(),
        content: content.to_string(),
        source_message_id: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_turn_text_round_trips_into_storage() {
    let provider = ScriptedProvider::new();
    provider.push_text(vec![
        text_delta("# Greeting\n"),
        text_delta("Hello "),
        text_delta("world."),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_rt", "hi")).await.unwrap();
    let events = collect_events(stream).await;
    let streamed = concat_text_deltas(&events);
    assert_eq!(streamed, "# Greeting\nHello world.");

    let messages = storage.load_chat_messages("chat_rt", 0).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    let assistant = &messages[1];
    assert_eq!(assistant.role, "assistant");
    let persisted = assistant.parts[0]["text"].as_str().unwrap();
    assert_eq!(persisted, streamed);

    // 标题生成是异步的单次调用，轮询等待落库。
    let mut title = DEFAULT_CHAT_TITLE.to_string();
    for _ in 0..50 {
        title = storage.get_chat("chat_rt").unwrap().unwrap().title;
        if title != DEFAULT_CHAT_TITLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(title, SCRIPTED_TITLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thinking_markers_never_reach_the_client() {
    let provider = ScriptedProvider::new();
    provider.push_text(vec![
        text_delta("**Thinking...**"),
        text_delta("> I should greet politely\n"),
        text_delta("# Greeting\n"),
        text_delta("Thinking... some more"),
        text_delta("Hi there friend"),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_tf", "hello")).await.unwrap();
    let events = collect_events(stream).await;
    let streamed = concat_text_deltas(&events);
    assert_eq!(streamed, "# Greeting\nHi there friend");
    assert!(!streamed.contains("Thinking"));

    let messages = storage.load_chat_messages("chat_tf", 0).unwrap();
    let persisted = messages[1].parts[0]["text"].as_str().unwrap();
    assert_eq!(persisted, streamed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_failure_surfaces_error_event_and_keeps_partial_text() {
    let provider = ScriptedProvider::new();
    provider.push_text_error(
        vec![text_delta("# Answer\n"), text_delta("partial ")],
        "upstream unavailable",
    );
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_err", "go")).await.unwrap();
    let events = collect_events(stream).await;
    assert!(events.iter().any(|event| matches!(
        event,
        StreamEvent::Error { message } if message.contains("upstream unavailable")
    )));

    let messages = storage.load_chat_messages("chat_err", 0).unwrap();
    let persisted = messages[1].parts[0]["text"].as_str().unwrap();
    assert_eq!(persisted, "# Answer\npartial ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_finalizes_partial_text_and_artifact() {
    let provider = ScriptedProvider::with_delay(Duration::from_millis(30));
    provider.push_text(vec![
        text_delta("# Intro\n"),
        tool_call("create_document", json!({"title": "Demo", "kind": "code"})),
        text_delta("alpha "),
        text_delta("beta "),
        text_delta("gamma "),
        text_delta("delta "),
        text_delta("epsilon "),
        text_delta("zeta "),
    ]);
    provider.push_object(vec![
        json!({"code": "fn"}),
        json!({"code": "fn main"}),
        json!({"code": "fn main()"}),
        json!({"code": "fn main() {"}),
        json!({"code": "fn main() {}"}),
        json!({"code": "fn main() {}\n"}),
        json!({"code": "fn main() {}\n// done"}),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let mut stream = orchestrator.stream(turn("chat_c", "build")).await.unwrap();
    let mut events = Vec::new();
    let mut text_count = 0usize;
    let mut artifact_delta_count = 0usize;
    let mut cancelled = false;
    while let Some(event) = stream.next().await {
        match &event {
            StreamEvent::TextDelta { .. } => text_count += 1,
            StreamEvent::ArtifactDelta { .. } => artifact_delta_count += 1,
            _ => {}
        }
        events.push(event);
        // 收到 2 条文本增量与 1 条工件增量后发起取消，其余事件照常排空。
        if !cancelled && text_count >= 2 && artifact_delta_count >= 1 {
            assert!(orchestrator.cancel("chat_c"));
            cancelled = true;
        }
    }
    assert!(cancelled);

    // 持久化文本与客户端看到的文本逐字节一致。
    let streamed = concat_text_deltas(&events);
    let messages = storage.load_chat_messages("chat_c", 0).unwrap();
    let assistant = messages.iter().find(|m| m.role == "assistant").unwrap();
    assert_eq!(assistant.parts[0]["text"].as_str().unwrap(), streamed);

    // 每个开始过的工件都必须收到 Finish，不允许停在生成中。
    let begun: HashSet<&str> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::ArtifactBegin { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    let finished: HashSet<&str> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::ArtifactFinish { id } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert!(!begun.is_empty());
    assert_eq!(begun, finished);
    assert!(!orchestrator.is_running("chat_c"));

    // 工件以最后一条累计增量的内容落库。
    let last_delta = events
        .iter()
        .rev()
        .find_map(|event| match event {
            StreamEvent::ArtifactDelta { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    let versions = storage.load_document_versions("chat_c", 0).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].content, last_delta);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn regeneration_truncates_trailing_messages() {
    let provider = ScriptedProvider::with_delay(Duration::from_millis(10));
    provider.push_text(vec![text_delta("# One\nfirst answer")]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_rg", "ask")).await.unwrap();
    collect_events(stream).await;
    let messages = storage.load_chat_messages("chat_rg", 0).unwrap();
    assert_eq!(messages.len(), 2);
    let user_message_id = messages[0].message_id.clone();

    provider.push_text(vec![text_delta("# Two\nsecond answer")]);
    let request = TurnRequest {
        chat_id: "chat_rg".to_string(),
        user_id: "user_a".to_string(),
        content: String::new(),
        source_message_id: Some(user_message_id.clone()),
    };
    let stream = orchestrator.stream(request).await.unwrap();
    collect_events(stream).await;

    let messages = storage.load_chat_messages("chat_rg", 0).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_id, user_message_id);
    let assistants = messages.iter().filter(|m| m.role == "assistant").count();
    assert_eq!(assistants, 1);
    assert_eq!(
        messages[1].parts[0]["text"].as_str().unwrap(),
        "# Two\nsecond answer"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_kind_fails_tool_call_but_stream_continues() {
    let provider = ScriptedProvider::new();
    provider.push_text(vec![
        text_delta("# Plan\n"),
        tool_call(
            "create_document",
            json!({"title": "X", "kind": "spreadsheet-v2"}),
        ),
    ]);
    provider.push_text(vec![text_delta("follow-up done")]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_uk", "make")).await.unwrap();
    let events = collect_events(stream).await;

    // 未注册的类型不产生任何工件事件，文本流继续送达。
    assert!(!events
        .iter()
        .any(|event| matches!(event, StreamEvent::ArtifactBegin { .. })));
    let streamed = concat_text_deltas(&events);
    assert!(streamed.contains("follow-up done"));

    let messages = storage.load_chat_messages("chat_uk", 0).unwrap();
    let assistant = messages.iter().find(|m| m.role == "assistant").unwrap();
    let tool_part = assistant.parts.as_array().unwrap().iter().find(|part| {
        part["type"] == "tool-invocation"
    });
    let tool_part = tool_part.expect("tool invocation part should be persisted");
    let error = tool_part["result"]["error"].as_str().unwrap();
    assert!(error.contains("no handler for kind spreadsheet-v2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_turn_on_same_chat_is_rejected() {
    let provider = ScriptedProvider::with_delay(Duration::from_millis(30));
    provider.push_text(vec![
        text_delta("# Busy\n"),
        text_delta("one "),
        text_delta("two "),
        text_delta("three "),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    let stream = orchestrator.stream(turn("chat_b", "first")).await.unwrap();
    let rejected = orchestrator.stream(turn("chat_b", "second")).await;
    let err = rejected.err().expect("second submit must be rejected");
    assert_eq!(err.code(), "USER_BUSY");

    // 在途轮次不受影响，照常完成并落库。
    let events = collect_events(stream).await;
    let streamed = concat_text_deltas(&events);
    assert_eq!(streamed, "# Busy\none two three ");
    let messages = storage.load_chat_messages("chat_b", 0).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].parts[0]["text"].as_str().unwrap(), streamed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_chat_is_rejected() {
    let provider = ScriptedProvider::new();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, storage) = build_stack(&provider, &dir);

    storage
        .save_chat(&atelier_server::storage::ChatRecord {
            chat_id: "chat_f".to_string(),
            user_id: "user_b".to_string(),
            title: "theirs".to_string(),
            visibility: "private".to_string(),
            created_at: 1.0,
            updated_at: 1.0,
        })
        .unwrap();

    let err = orchestrator
        .stream(turn("chat_f", "hello"))
        .await
        .err()
        .expect("foreign chat must be rejected");
    assert_eq!(err.code(), "FORBIDDEN");
}
