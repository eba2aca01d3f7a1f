//! Gateway behavior against a wire-level mock provider: retry policy,
//! error classification, streaming decode and cancellation timing.

use fabula::config::Config;
use fabula::error::LlmError;
use fabula::llm::{
    CancelToken, ChatMessage, ChatProvider, ChatRequest, LlmGateway, RetryPolicy, StreamCollector,
    StreamEvent,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn provider_for(server: &MockServer) -> Arc<fabula::llm::openai::OpenAiProvider> {
    Arc::new(fabula::llm::openai::OpenAiProvider::compatible(
        "openai",
        &server.uri(),
        "sk-test-key",
        "gpt-4o-mini",
        8192,
    ))
}

fn fast_gateway(provider: Arc<fabula::llm::openai::OpenAiProvider>) -> LlmGateway {
    LlmGateway::new(provider, &Config::default()).with_retry_policy(RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        multiplier: 2,
        max_delay: Duration::from_millis(50),
    })
}

fn request() -> ChatRequest {
    ChatRequest::new(vec![
        ChatMessage::system("you are a novelist"),
        ChatMessage::user("write one line"),
    ])
}

fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
    })
}

#[tokio::test]
async fn generate_round_trips_usage_and_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("The rain held.")))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let response = gateway
        .generate(&request())
        .await
        .expect("request should succeed");

    assert_eq!(response.content, "The rain held.");
    assert_eq!(response.usage.prompt, 12);
    assert_eq!(response.usage.completion, 5);
}

#[tokio::test]
async fn auth_failure_surfaces_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let error = gateway.generate(&request()).await.unwrap_err();
    assert!(matches!(error, LlmError::Auth { .. }));
}

#[tokio::test]
async fn server_errors_retry_until_recovery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream hiccup"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let response = gateway
        .generate(&request())
        .await
        .expect("retries should recover");
    assert_eq!(response.content, "recovered");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn rate_limit_maps_to_rate_limited_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let error = gateway.generate(&request()).await.unwrap_err();
    assert!(matches!(error, LlmError::RateLimited { .. }));
}

#[tokio::test]
async fn context_length_error_maps_to_overflow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(r#"{"error":{"code":"context_length_exceeded"}}"#),
        )
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let error = gateway.generate(&request()).await.unwrap_err();
    assert!(matches!(error, LlmError::ContextOverflow { .. }));
}

fn sse_body() -> String {
    [
        r#"data: {"id":"c1","model":"gpt-4o-mini","choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        r#"data: {"choices":[{"delta":{"content":"The rain "},"finish_reason":null}]}"#,
        r#"data: {"choices":[{"delta":{"content":"held."},"finish_reason":"stop"}]}"#,
        r#"data: {"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n")
}

#[tokio::test]
async fn streaming_decodes_sse_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let mut stream = gateway
        .generate_stream(&request(), CancelToken::new())
        .await
        .expect("stream should open");

    let mut collector = StreamCollector::new();
    let mut saw_done = false;
    while let Some(event) = stream.next().await {
        let event = event.expect("stream event should decode");
        if matches!(event, StreamEvent::Done { .. }) {
            saw_done = true;
        }
        collector.feed(&event);
    }

    assert!(saw_done);
    let response = collector.finish();
    assert_eq!(response.content, "The rain held.");
    assert_eq!(response.usage.total, 12);
}

#[tokio::test]
async fn stream_cancellation_releases_quickly() {
    let server = MockServer::start().await;
    // A stream that trickles forever would stall an uncancelled consumer;
    // the cancelled stream must end well inside the 500ms bound.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(), "text/event-stream")
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    let cancel = CancelToken::new();
    let mut stream = gateway
        .generate_stream(&request(), cancel.clone())
        .await
        .expect("stream should open");

    cancel.cancel();
    let started = std::time::Instant::now();
    while stream.next().await.is_some() {}
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "cancelled stream took {:?} to end",
        started.elapsed()
    );
}

#[tokio::test]
async fn token_heuristic_feeds_window_precheck() {
    let server = MockServer::start().await;
    // No mock mounted: an oversized prompt must be rejected before any
    // request is sent.
    let provider = Arc::new(fabula::llm::openai::OpenAiProvider::compatible(
        "openai",
        &server.uri(),
        "sk-test-key",
        "gpt-4o-mini",
        16,
    ));
    let gateway = fast_gateway(provider.clone());

    let oversized = ChatRequest::new(vec![ChatMessage::user("x".repeat(400))]);
    let error = gateway.generate(&oversized).await.unwrap_err();
    assert!(matches!(error, LlmError::ContextOverflow { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(provider.count_tokens("abcdefgh"), 2);
}

#[tokio::test]
async fn request_carries_auth_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .mount(&server)
        .await;

    let gateway = fast_gateway(provider_for(&server));
    gateway
        .generate(&request())
        .await
        .expect("request should succeed");

    let received: Vec<Request> = server.received_requests().await.unwrap();
    let sent = &received[0];
    assert_eq!(
        sent.headers
            .get("authorization")
            .map(|v| v.to_str().unwrap_or_default()),
        Some("Bearer sk-test-key")
    );
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["stream"], false);
}
