use dingtalk_assistant::{
    testing::{test_client, test_client_with},
    Config, InvocationState, EMPTY_QUERY_MESSAGE,
};
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(events: &[(&str, &str)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
        .collect()
}

fn answer_body() -> String {
    sse(&[
        ("thread.run.created", r#"{"runId":"run_1"}"#),
        ("thread.message.created", r#"{"messageId":"msg_a"}"#),
        (
            "thread.message.delta",
            r#"{"delta":{"text":{"value":"Hello"}}}"#,
        ),
        (
            "thread.message.delta",
            r#"{"delta":{"text":{"value":", world"}}}"#,
        ),
        (
            "thread.message.completed",
            r#"{"content":[{"type":"text","text":{"value":"Hello, world"}}]}"#,
        ),
        ("thread.run.completed", r#"{"statusEnum":"COMPLETED"}"#),
        ("done", "[DONE]"),
    ])
}

async fn mount_session(server: &MockServer, thread_id: &str) {
    Mock::given(method("POST"))
        .and(path("/v1.0/oauth2/accessToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "tok_inv", "expireIn": 7200})),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/assistant/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"threadId": thread_id})))
        .mount(server)
        .await;
}

async fn mount_message(server: &MockServer, thread_id: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(format!("/v1.0/assistant/threads/{thread_id}/messages")))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"messageId": "msg_u"})))
        .mount(server)
        .await;
}

async fn mount_run(server: &MockServer, thread_id: &str, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/v1.0/assistant/threads/{thread_id}/runs")))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn expect_delete(server: &MockServer, thread_id: &str, times: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("/v1.0/assistant/threads/{thread_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn streams_increments_and_deletes_thread() {
    let server = MockServer::start().await;
    mount_session(&server, "th_ok").await;
    mount_message(&server, "th_ok", 200).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/assistant/threads/th_ok/runs"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({
            "assistantId": "asst_test",
            "instructions": "be brief",
            "stream": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(answer_body(), "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;
    expect_delete(&server, "th_ok", 1).await;

    let client = test_client(&server.uri());
    let mut invocation = client
        .invoker()
        .invoke("Say hello", Some("be brief".to_string()));
    let mut chunks = Vec::new();
    while let Some(chunk) = invocation.next().await {
        chunks.push(chunk);
    }

    assert_eq!(chunks, vec!["Hello".to_string(), ", world".to_string()]);
    assert_eq!(invocation.state(), InvocationState::CleanedUp);
    assert!(invocation.thread_id().is_none());
}

#[tokio::test]
async fn blank_query_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let output = client.invoker().invoke("   ", None).collect_output().await;
    assert_eq!(output, EMPTY_QUERY_MESSAGE);
}

#[tokio::test]
async fn missing_assistant_id_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = test_client_with(
        &server.uri(),
        Config {
            assistant_id: Some(" ".to_string()),
            ..Default::default()
        },
    );
    let output = client.invoker().invoke("hi", None).collect_output().await;
    assert!(output.starts_with("Error:"), "got {output:?}");
}

#[tokio::test]
async fn failed_run_yields_one_error_chunk() {
    let server = MockServer::start().await;
    mount_session(&server, "th_fail").await;
    mount_message(&server, "th_fail", 200).await;
    let body = sse(&[
        ("thread.run.created", r#"{"runId":"run_f"}"#),
        (
            "thread.run.completed",
            r#"{"statusEnum":"FAILED","lastError":{"message":"rate limited"}}"#,
        ),
        ("done", "[DONE]"),
    ]);
    mount_run(
        &server,
        "th_fail",
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
    )
    .await;
    expect_delete(&server, "th_fail", 1).await;

    let client = test_client(&server.uri());
    let chunks: Vec<String> = client.invoker().invoke("hi", None).collect().await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].contains("rate limited"), "got {chunks:?}");
}

#[tokio::test]
async fn message_failure_still_deletes_thread_once() {
    let server = MockServer::start().await;
    mount_session(&server, "th_msg").await;
    mount_message(&server, "th_msg", 400).await;
    expect_delete(&server, "th_msg", 1).await;

    let client = test_client(&server.uri());
    let mut invocation = client.invoker().invoke("hi", None);
    let first = invocation.next().await.expect("error chunk");
    assert!(first.starts_with("An error occurred"), "got {first:?}");
    assert!(invocation.next().await.is_none());
    assert_eq!(invocation.state(), InvocationState::CleanedUp);
}

#[tokio::test]
async fn run_start_failure_still_deletes_thread_once() {
    let server = MockServer::start().await;
    mount_session(&server, "th_run").await;
    mount_message(&server, "th_run", 200).await;
    mount_run(
        &server,
        "th_run",
        ResponseTemplate::new(500).set_body_json(json!({
            "code": "InternalError",
            "message": "assistant unavailable"
        })),
    )
    .await;
    expect_delete(&server, "th_run", 1).await;

    let client = test_client(&server.uri());
    let output = client.invoker().invoke("hi", None).collect_output().await;
    assert!(output.contains("assistant unavailable"), "got {output:?}");
}

#[tokio::test]
async fn malformed_payloads_are_skipped() {
    let server = MockServer::start().await;
    mount_session(&server, "th_bad").await;
    mount_message(&server, "th_bad", 200).await;
    let body = sse(&[
        ("thread.message.created", r#"{"messageId":"m1"}"#),
        ("thread.message.delta", r#"{"delta": nope"#),
        ("thread.message.delta", r#"{"delta":{"text":{"value":"fine"}}}"#),
        ("done", "[DONE]"),
    ]);
    mount_run(
        &server,
        "th_bad",
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
    )
    .await;
    expect_delete(&server, "th_bad", 1).await;

    let client = test_client(&server.uri());
    let output = client.invoker().invoke("hi", None).collect_output().await;
    assert_eq!(output, "fine");
}

#[tokio::test]
async fn tool_parameters_drive_the_query() {
    let server = MockServer::start().await;
    mount_session(&server, "th_tool").await;
    Mock::given(method("POST"))
        .and(path("/v1.0/assistant/threads/th_tool/messages"))
        .and(body_partial_json(json!({"role": "user", "content": "weather?"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messageId": "m"})))
        .expect(1)
        .mount(&server)
        .await;
    mount_run(
        &server,
        "th_tool",
        ResponseTemplate::new(200).set_body_raw(answer_body(), "text/event-stream"),
    )
    .await;
    expect_delete(&server, "th_tool", 1).await;

    let client = test_client(&server.uri());
    let output = client
        .invoker()
        .invoke_tool(&json!({"query": "weather?"}))
        .collect_output()
        .await;
    assert_eq!(output, "Hello, world");
}

#[tokio::test]
async fn long_answer_in_one_body_is_streamed_whole() {
    let server = MockServer::start().await;
    mount_session(&server, "th_long").await;
    mount_message(&server, "th_long", 200).await;
    let mut body = sse(&[("thread.message.created", r#"{"messageId":"m_long"}"#)]);
    let mut expected = String::new();
    for i in 0..6000 {
        let word = format!("w{i} ");
        body.push_str(&format!(
            "event: thread.message.delta\ndata: {{\"delta\":{{\"text\":{{\"value\":\"{word}\"}}}}}}\n\n"
        ));
        expected.push_str(&word);
    }
    body.push_str("event: done\ndata: [DONE]\n\n");
    mount_run(
        &server,
        "th_long",
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
    )
    .await;
    expect_delete(&server, "th_long", 1).await;

    let client = test_client(&server.uri());
    let output = client.invoker().invoke("q", None).collect_output().await;
    assert_eq!(output, expected);
}
