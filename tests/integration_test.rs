use futures::StreamExt;
use model_bridge::config::{BridgeConfig, ModelConfig, ModelTarget};
use model_bridge::error::BridgeError;
use model_bridge::logging::SharedLogger;
use model_bridge::translate::openai_types::{ChatMessage, ToolCall};
use model_bridge::{
    BridgeClient, ChatRequest, GenerationParams, ModelEvent, ModelUpdate, Orchestrator, Protocol,
    StreamChunk,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(events: &[&str]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

fn openai_sse() -> String {
    sse(&[
        r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        "[DONE]",
    ])
}

fn target(protocol: Protocol, api_url: &str) -> ModelTarget {
    ModelTarget {
        key: "test".to_string(),
        api_url: api_url.to_string(),
        api_key: "sk-test".to_string(),
        protocol,
        model: "test-model".to_string(),
        anthropic_api_path: None,
        bare_base_fallback: true,
        temperature: None,
        max_tokens: None,
    }
}

fn client() -> BridgeClient {
    BridgeClient::new(reqwest::Client::new(), SharedLogger::in_memory())
}

async fn collect(
    client: &BridgeClient,
    target: ModelTarget,
) -> Vec<Result<StreamChunk, BridgeError>> {
    client
        .stream(
            target,
            GenerationParams::default(),
            vec![ChatMessage::user("hi")],
            CancellationToken::new(),
        )
        .collect()
        .await
}

fn text_of(chunks: &[Result<StreamChunk, BridgeError>]) -> String {
    chunks
        .iter()
        .filter_map(|c| match c {
            Ok(StreamChunk::Content { content }) => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Normalizer against a mock HTTP server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_openai_404_falls_through_to_next_candidate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .expect(2)
        .mount(&server)
        .await;

    let client = client();
    let chunks = collect(&client, target(Protocol::OpenAi, &server.uri())).await;
    assert_eq!(text_of(&chunks), "Hello");
    assert!(chunks.iter().all(Result::is_ok));

    let selected = client
        .logger()
        .recent(20)
        .into_iter()
        .find(|e| e.message == "Endpoint selected")
        .unwrap();
    assert_eq!(
        selected.context.unwrap()["url"],
        format!("{}/chat/completions", server.uri())
    );

    // Second request goes straight to the endpoint that worked.
    let chunks = collect(&client, target(Protocol::OpenAi, &server.uri())).await;
    assert_eq!(text_of(&chunks), "Hello");
}

#[tokio::test]
async fn test_non_404_status_is_terminal_with_body_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "invalid api key", "type": "auth"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .expect(0)
        .mount(&server)
        .await;

    let chunks = collect(&client(), target(Protocol::OpenAi, &server.uri())).await;
    assert_eq!(chunks.len(), 1);
    match &chunks[0] {
        Err(BridgeError::Http { status, message }) => {
            assert_eq!(*status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_last_candidate_404_reports_status() {
    let server = MockServer::start().await;

    let chunks = collect(&client(), target(Protocol::OpenAi, &server.uri())).await;
    assert!(matches!(chunks.as_slice(), [Err(BridgeError::Http { status: 404, .. })]));
}

#[tokio::test]
async fn test_malformed_line_is_skipped() {
    let server = MockServer::start().await;
    let body = sse(&[
        r#"{"choices":[{"delta":{"content":"a"}}]}"#,
        "{not json",
        r#"{"choices":[{"delta":{"content":"b"}}]}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = client();
    let chunks = collect(&client, target(Protocol::OpenAi, &format!("{}/v1", server.uri()))).await;
    assert_eq!(text_of(&chunks), "ab");
    assert!(chunks.iter().all(Result::is_ok));
    assert!(client
        .logger()
        .recent(10)
        .iter()
        .any(|e| e.message.contains("Skipping malformed line")));
}

#[tokio::test]
async fn test_error_payload_in_stream_is_fatal() {
    let server = MockServer::start().await;
    let body = sse(&[
        r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
        r#"{"error":{"message":"overloaded"}}"#,
        r#"{"choices":[{"delta":{"content":"never"}}]}"#,
    ]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let chunks = collect(&client(), target(Protocol::OpenAi, &format!("{}/v1", server.uri()))).await;
    assert_eq!(chunks.len(), 2);
    assert!(matches!(&chunks[1], Err(BridgeError::Upstream { message }) if message == "overloaded"));
}

#[tokio::test]
async fn test_json_response_uses_non_stream_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "whole answer"}}]
        })))
        .mount(&server)
        .await;

    let chunks = collect(&client(), target(Protocol::OpenAi, &format!("{}/v1", server.uri()))).await;
    assert_eq!(text_of(&chunks), "whole answer");
    assert_eq!(chunks.len(), 1);
}

#[tokio::test]
async fn test_anthropic_stream_with_tool_use() {
    let server = MockServer::start().await;
    let body = [
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Checking\"}}\n\n",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"get_weather\",\"input\":{}}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"city\\\":\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"London\\\"}\"}}\n\n",
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ]
    .concat();
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let chunks = collect(&client(), target(Protocol::Anthropic, &server.uri())).await;
    assert_eq!(text_of(&chunks), "Checking");

    let merged = chunks
        .into_iter()
        .filter_map(|c| match c {
            Ok(StreamChunk::ToolCalls { tool_calls }) => Some(tool_calls),
            _ => None,
        })
        .fold(Vec::new(), |acc, fragments| {
            model_bridge::translate::accumulator::merge_tool_calls(acc, &fragments)
        });
    assert_eq!(
        merged,
        vec![ToolCall::new("toolu_1", "get_weather", r#"{"city":"London"}"#)]
    );
}

#[tokio::test]
async fn test_anthropic_bare_base_is_last_resort() {
    let server = MockServer::start().await;
    let body = sse(&[
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"proxied"}}"#,
        r#"{"type":"message_stop"}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/relay"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let chunks = collect(
        &client(),
        target(Protocol::Anthropic, &format!("{}/relay", server.uri())),
    )
    .await;
    assert_eq!(text_of(&chunks), "proxied");
}

#[tokio::test]
async fn test_cancelled_token_aborts_before_send() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .expect(0)
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    token.cancel();
    let chunks: Vec<_> = client()
        .stream(
            target(Protocol::OpenAi, &format!("{}/v1", server.uri())),
            GenerationParams::default(),
            vec![ChatMessage::user("hi")],
            token,
        )
        .collect()
        .await;
    assert!(matches!(chunks.as_slice(), [Err(BridgeError::Aborted)]));
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

fn two_model_config(server_uri: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.models.insert(
        "a".to_string(),
        ModelConfig {
            api_url: Some(server_uri.to_string()),
            api_key_env: Some("MODEL_BRIDGE_INTEGRATION_KEY_NEVER_SET".to_string()),
            ..ModelConfig::default()
        },
    );
    config.models.insert(
        "b".to_string(),
        ModelConfig {
            api_url: Some(format!("{server_uri}/v1")),
            api_key: Some("sk-b".to_string()),
            model: Some("model-b".to_string()),
            ..ModelConfig::default()
        },
    );
    config
}

fn orchestrator(config: BridgeConfig) -> Orchestrator<BridgeConfig> {
    Orchestrator::new(Arc::new(config), client())
}

fn events_for<'a>(updates: &'a [ModelUpdate], key: &str) -> Vec<&'a ModelEvent> {
    updates
        .iter()
        .filter(|u| u.model_key == key)
        .map(|u| &u.event)
        .collect()
}

#[tokio::test]
async fn test_misconfigured_model_is_isolated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let keys = vec!["a".to_string(), "b".to_string()];
    let updates: Vec<ModelUpdate> = orchestrator(two_model_config(&server.uri()))
        .stream_many(
            &keys,
            ChatRequest::new(vec![ChatMessage::user("hi")]),
            CancellationToken::new(),
        )
        .collect()
        .await;

    assert_eq!(updates[0].model_key, "a");
    assert!(matches!(&updates[0].event, ModelEvent::Error { message } if message.contains("MODEL_BRIDGE_INTEGRATION_KEY_NEVER_SET")));
    assert_eq!(events_for(&updates, "a").len(), 1);

    let b = events_for(&updates, "b");
    assert_eq!(
        b,
        vec![
            &ModelEvent::Content { content: "Hel".to_string() },
            &ModelEvent::Content { content: "lo".to_string() },
            &ModelEvent::Done {
                content: "Hello".to_string(),
                reasoning: String::new(),
                tool_calls: vec![],
            },
        ]
    );
}

#[tokio::test]
async fn test_failed_attempt_retries_with_fallback_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("plain question"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"message": "image input not supported"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = ChatRequest::new(vec![ChatMessage::user("rich question")]);
    request.fallback_messages = Some(vec![ChatMessage::user("plain question")]);

    let keys = vec!["b".to_string()];
    let updates: Vec<ModelUpdate> = orchestrator(two_model_config(&server.uri()))
        .stream_many(&keys, request, CancellationToken::new())
        .collect()
        .await;

    let names: Vec<&str> = updates.iter().map(|u| u.event.name()).collect();
    assert_eq!(names, ["retry", "content", "content", "done"]);
}

#[tokio::test]
async fn test_second_failure_becomes_error_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .expect(2)
        .mount(&server)
        .await;

    let keys = vec!["b".to_string()];
    let updates: Vec<ModelUpdate> = orchestrator(two_model_config(&server.uri()))
        .stream_many(
            &keys,
            ChatRequest::new(vec![ChatMessage::user("hi")]),
            CancellationToken::new(),
        )
        .collect()
        .await;

    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].event, ModelEvent::Retry);
    assert_eq!(
        updates[1].event,
        ModelEvent::Error {
            message: "upstream unavailable".to_string()
        }
    );
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_server_streams_tagged_sse_events() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(openai_sse(), "text/event-stream"))
        .mount(&upstream)
        .await;

    let config = Arc::new(two_model_config(&upstream.uri()));
    let logger = SharedLogger::in_memory();
    let state = Arc::new(model_bridge::AppState {
        config: config.clone(),
        orchestrator: Orchestrator::new(
            config,
            BridgeClient::new(reqwest::Client::new(), logger.clone()),
        ),
        logger,
    });

    let app = model_bridge::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let http = reqwest::Client::new();

    let health = http.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let models: serde_json::Value = http
        .get(format!("http://{addr}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["data"].as_array().unwrap().len(), 2);

    let response = http
        .post(format!("http://{addr}/v1/stream"))
        .json(&serde_json::json!({
            "models": ["a", "b"],
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();

    assert!(body.contains("event: error"));
    assert!(body.contains("event: content"));
    assert!(body.contains("event: done"));
    assert!(body.contains(r#""model_key":"b""#));
    assert!(body.contains(r#""content":"Hello""#));

    let logs: serde_json::Value = http
        .get(format!("http://{addr}/v1/logs?limit=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = logs["data"].as_array().unwrap();
    assert!(!entries.is_empty() && entries.len() <= 5);

    let bad = http
        .post(format!("http://{addr}/v1/stream"))
        .json(&serde_json::json!({"models": [], "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

// ---------------------------------------------------------------------------
// Long-running streams
// ---------------------------------------------------------------------------

/// Upstream that sends `count` content chunks, one every `gap`, then `[DONE]`.
async fn spawn_steady_upstream(count: usize, gap: std::time::Duration) -> String {
    use axum::response::sse::{Event, Sse};
    use axum::routing::post;
    use std::convert::Infallible;

    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            let events = async_stream::stream! {
                for i in 0..count {
                    tokio::time::sleep(gap).await;
                    let data = serde_json::json!({"choices": [{"delta": {"content": format!("{i},")}}]});
                    yield Ok::<_, Infallible>(Event::default().data(data.to_string()));
                }
                yield Ok(Event::default().data("[DONE]"));
            };
            Sse::new(events)
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

#[tokio::test]
async fn test_active_stream_outlives_connect_timeout() {
    let api_url = spawn_steady_upstream(8, std::time::Duration::from_millis(300)).await;

    let mut config = BridgeConfig {
        idle_timeout_secs: 1,
        connect_timeout_secs: 1,
        ..BridgeConfig::default()
    };
    config.models.insert(
        "slow".to_string(),
        ModelConfig {
            api_url: Some(api_url),
            api_key: Some("sk-slow".to_string()),
            ..ModelConfig::default()
        },
    );

    let http = config.http_client().unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(config.clone()),
        BridgeClient::new(http, SharedLogger::in_memory()),
    )
    .with_idle_timeout(config.idle_timeout());

    let keys = vec!["slow".to_string()];
    let updates: Vec<ModelUpdate> = orchestrator
        .stream_many(
            &keys,
            ChatRequest::new(vec![ChatMessage::user("count slowly")]),
            CancellationToken::new(),
        )
        .collect()
        .await;

    let names: Vec<&str> = updates.iter().map(|u| u.event.name()).collect();
    let mut expected = vec!["content"; 8];
    expected.push("done");
    assert_eq!(names, expected);
    match &updates.last().unwrap().event {
        ModelEvent::Done { content, .. } => assert_eq!(content, "0,1,2,3,4,5,6,7,"),
        other => panic!("expected done, got {other:?}"),
    }
}
