use std::time::Duration;

use dingtalk_assistant::{
    testing::{start_chunked_sse_server, start_sse_server, test_client},
    AssistantId, Error, RunStatus, StreamEvent, ThreadId,
};
use futures_util::StreamExt;

fn step(text: &str) -> (Duration, String) {
    (Duration::from_millis(5), text.to_string())
}

#[tokio::test]
async fn events_split_across_chunks_are_reassembled() {
    let base = start_chunked_sse_server(
        vec![
            step("event: thread.run.created\ndata: {\"runId\":\"run_9\"}\n\nevent: thread.mess"),
            step("age.created\ndata: {\"messageId\":\"m1\"}\n\n"),
            step("event: thread.message.delta\ndata: {\"delta\":{\"text\":{\"va"),
            step("lue\":\"Hi\"}}}\n\nevent: thread.message.delta\n"),
            step("data: {\"delta\":{\"text\":{\"value\":\" there\"}}}\n\n"),
            step("event: thread.run.completed\ndata: {\"statusEnum\":\"COMPLETED\"}\n\n"),
            step("event: done\ndata: [DONE]\n\n"),
        ],
        None,
    )
    .await;

    let client = test_client(&base);
    let mut stream = client
        .runs()
        .create(&ThreadId::new("t1"), &AssistantId::new("a1"), None)
        .await
        .expect("run stream");

    let mut texts = Vec::new();
    while let Some(item) = stream.next().await {
        if let Some(text) = item.expect("event").text() {
            texts.push(text.to_string());
        }
    }
    assert_eq!(texts, vec!["Hi".to_string(), "Hi there".to_string()]);
    assert!(stream.saw_terminal());
    assert_eq!(stream.run_id().map(|id| id.as_str().to_string()), Some("run_9".to_string()));
}

#[tokio::test]
async fn collect_text_returns_final_output() {
    let base = start_sse_server(vec![
        "event: thread.message.created\ndata: {\"messageId\":\"m1\"}\n\n".to_string(),
        "event: thread.message.delta\ndata: {\"delta\":{\"text\":{\"value\":\"42\"}}}\n\n"
            .to_string(),
        "event: thread.run.completed\ndata: {\"statusEnum\":\"COMPLETED\"}\n\n".to_string(),
        "event: done\ndata: [DONE]\n\n".to_string(),
    ])
    .await;

    let client = test_client(&base);
    let output = client
        .runs()
        .create(&ThreadId::new("t1"), &AssistantId::new("a1"), Some("  "))
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(output.text, "42");
    assert_eq!(output.status, Some(RunStatus::Completed));
    assert!(output.error.is_none());
}

#[tokio::test]
async fn stream_without_done_ends_at_eof() {
    let base = start_sse_server(vec![
        "event: thread.message.delta\ndata: {\"delta\":{\"text\":{\"value\":\"partial\"}}}\n\n"
            .to_string(),
    ])
    .await;

    let client = test_client(&base);
    let mut stream = client
        .runs()
        .create(&ThreadId::new("t1"), &AssistantId::new("a1"), None)
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(matches!(first, StreamEvent::MessageDelta { ref text, .. } if text == "partial"));
    assert!(stream.next().await.is_none());
    assert!(!stream.saw_terminal());
}

#[tokio::test]
async fn blank_ids_are_rejected() {
    let client = test_client("http://127.0.0.1:9");
    let err = client
        .runs()
        .create(&ThreadId::new(" "), &AssistantId::new("a1"), None)
        .await
        .err()
        .expect("validation error");
    assert!(matches!(err, Error::Config(_)));
}
