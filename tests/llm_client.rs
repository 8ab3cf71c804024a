//! Transport tests against a local mock endpoint.

use std::time::Duration;

use projlens::config::LlmSettings;
use projlens::llm::{CompletionBackend, DeltaSource, LlmClient, LlmError, Timeouts};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENDPOINT: &str = "/v1/chat/completions";

fn settings(server: &MockServer) -> LlmSettings {
    LlmSettings {
        api_url: format!("{}{}", server.uri(), ENDPOINT),
        api_key: "k".to_string(),
        model: "test-model".to_string(),
    }
}

fn sse(lines: &[&str]) -> String {
    lines.iter().map(|l| format!("{}\n\n", l)).collect()
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("Authorization", "Bearer k"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn drain(mut source: Box<dyn DeltaSource>) -> Vec<String> {
    let mut deltas = Vec::new();
    while let Some(d) = source.next_delta().await.unwrap() {
        deltas.push(d);
    }
    deltas
}

#[tokio::test]
async fn test_stream_yields_deltas_in_order() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]),
    )
    .await;

    let client = LlmClient::new(settings(&server)).unwrap();
    let source = CompletionBackend::stream(&client, "hi").await.unwrap();
    let deltas = drain(source).await;

    assert_eq!(deltas, vec!["Hel", "lo"]);
    assert_eq!(deltas.concat(), "Hello");
}

#[tokio::test]
async fn test_stream_skips_malformed_and_stops_at_done() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            ": keep-alive",
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            "data: {not json",
            r#"data: {"choices":[{"text":"A"}]}"#,
            r#"data: {"choices":[{"delta":{"content":null}}]}"#,
            "data: [DONE]",
            r#"data: {"choices":[{"text":"after done"}]}"#,
        ]),
    )
    .await;

    let client = LlmClient::new(settings(&server)).unwrap();
    let source = CompletionBackend::stream(&client, "hi").await.unwrap();
    assert_eq!(drain(source).await, vec!["A"]);
}

#[tokio::test]
async fn test_stream_without_done_ends_at_eof() {
    let server = MockServer::start().await;
    // Last line has no terminator.
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\
                data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}"
        .to_string();
    mount_stream(&server, body).await;

    let client = LlmClient::new(settings(&server)).unwrap();
    let source = CompletionBackend::stream(&client, "hi").await.unwrap();
    assert_eq!(drain(source).await, vec!["x", "y"]);
}

#[tokio::test]
async fn test_complete_reads_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(body_string_contains("\"stream\":false"))
        .and(body_string_contains("\"model\":\"test-model\""))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"project_name\":\"X\"}"}}]}"#,
        ))
        .mount(&server)
        .await;

    let client = LlmClient::new(settings(&server)).unwrap();
    let text = client.complete("hi").await.unwrap();
    assert_eq!(text, r#"{"project_name":"X"}"#);
}

#[tokio::test]
async fn test_complete_returns_raw_body_without_choices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain answer"))
        .mount(&server)
        .await;

    let client = LlmClient::new(settings(&server)).unwrap();
    assert_eq!(client.complete("hi").await.unwrap(), "plain answer");
}

#[tokio::test]
async fn test_server_error_is_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
        .mount(&server)
        .await;

    let client = LlmClient::new(settings(&server)).unwrap();

    match client.complete("hi").await {
        Err(LlmError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "model overloaded");
        }
        other => panic!("expected status error, got {:?}", other),
    }

    let streamed = CompletionBackend::stream(&client, "hi").await;
    assert!(matches!(
        streamed,
        Err(LlmError::Status { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let timeouts = Timeouts {
        connect: Duration::from_secs(5),
        write: Duration::from_millis(100),
        read: Duration::from_millis(100),
    };
    let client = LlmClient::with_timeouts(settings(&server), timeouts).unwrap();
    assert!(matches!(
        client.complete("hi").await,
        Err(LlmError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Nothing listens on port 1.
    let settings = LlmSettings {
        api_url: format!("http://127.0.0.1:1{}", ENDPOINT),
        api_key: "k".to_string(),
        model: "test-model".to_string(),
    };

    let client = LlmClient::new(settings).unwrap();
    assert!(matches!(
        client.complete("hi").await,
        Err(LlmError::Network(_))
    ));
}
