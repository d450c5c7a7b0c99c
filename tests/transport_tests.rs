// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley::config::settings::{ResilienceConfig, RetryPolicy};
use parley::error::{ErrorKind, ParleyError};
use parley::llm::{
    ChatMessage, ChatRequest, ChatTransport, FetchHooks, FinishReason, HttpTransport,
    ResilientTransport, ResponseChunk, Usage,
};
use parley::pipeline::{ChatPipeline, LogFinalizer, PipelineStatus, PrepareParams, StaticPreparer};

const SSE_BODY: &str = concat!(
    "data: {\"id\":\"c1\",\"model\":\"gpt-test\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"id\":\"c1\",\"model\":\"gpt-test\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
    "data: [DONE]\n\n",
);

#[derive(Default)]
struct CountingHooks {
    before: AtomicUsize,
    after: AtomicUsize,
}

impl FetchHooks for CountingHooks {
    fn before_fetch(&self) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn after_fetch(&self) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

fn request(stream: bool) -> ChatRequest {
    ChatRequest::new("gpt-test", vec![ChatMessage::user("hi")]).with_stream(stream)
}

fn sse_response() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(SSE_BODY)
}

fn fast_retries(policy: RetryPolicy) -> ResilienceConfig {
    ResilienceConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        retry_policy: policy,
        ..ResilienceConfig::default()
    }
}

#[tokio::test]
async fn test_streaming_response_decodes_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(sse_response())
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), Some("sk-test".to_string()));
    let stream = transport
        .send(&request(true), &CancellationToken::new())
        .await
        .unwrap();
    let chunks: Vec<ResponseChunk> = stream.try_collect().await.unwrap();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content.as_deref(), Some("Hel"));
    assert_eq!(chunks[1].finish_reason, Some(FinishReason::Stop));
    assert_eq!(chunks[2].usage, Some(Usage::new(5, 2)));
    assert_eq!(chunks[2].id.as_deref(), Some("c1"));

    let received = server.received_requests().await.unwrap();
    let body: Value = received[0].body_json().unwrap();
    assert_eq!(body["stream"], json!(true));
    assert_eq!(body["stream_options"]["include_usage"], json!(true));
    assert_eq!(body["messages"][0]["role"], json!("user"));
}

#[tokio::test]
async fn test_non_streaming_response_is_single_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "c2",
            "choices": [{
                "message": {"role": "assistant", "content": "Hi there", "reasoning_content": "short"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), None);
    let chunks: Vec<ResponseChunk> = transport
        .send(&request(false), &CancellationToken::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content.as_deref(), Some("Hi there"));
    assert_eq!(chunks[0].reasoning.as_deref(), Some("short"));
    assert_eq!(chunks[0].model.as_deref(), Some("gpt-test"));
    assert_eq!(chunks[0].usage, Some(Usage::new(3, 2)));
}

#[tokio::test]
async fn test_error_status_fires_hooks_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let hooks = Arc::new(CountingHooks::default());
    let transport = HttpTransport::new(server.uri(), None).with_hooks(hooks.clone());
    let error = match transport.send(&request(true), &CancellationToken::new()).await {
        Ok(_) => panic!("expected server error"),
        Err(e) => e,
    };

    match &error {
        ParleyError::Server { status, message } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "upstream exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resilient_transport_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(sse_response())
        .mount(&server)
        .await;

    let transport = ResilientTransport::new(
        HttpTransport::new(server.uri(), None),
        &fast_retries(RetryPolicy::RetriableOnly),
    );
    let chunks: Vec<ResponseChunk> = transport
        .send(&request(true), &CancellationToken::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(chunks.len(), 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let transport = ResilientTransport::new(
        HttpTransport::new(server.uri(), None),
        &fast_retries(RetryPolicy::RetriableOnly),
    );
    let result = transport.send(&request(true), &CancellationToken::new()).await;

    assert!(matches!(result, Err(ParleyError::Server { status: 400, .. })));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_token_aborts_send() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_response())
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    token.cancel();
    let transport = HttpTransport::new(server.uri(), None);
    let result = transport.send(&request(true), &token).await;
    assert!(matches!(result, Err(ParleyError::Cancelled)));
}

#[tokio::test]
async fn test_pipeline_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response())
        .mount(&server)
        .await;

    let pipeline = ChatPipeline::new(
        Arc::new(HttpTransport::new(server.uri(), None)),
        Arc::new(StaticPreparer::new("gpt-test").with_system_prompt("Be brief")),
        Arc::new(LogFinalizer),
    );
    let context = pipeline.start(PrepareParams::new("hi")).await.unwrap();
    let streaming = context.require_streaming().unwrap();

    assert_eq!(pipeline.status(), PipelineStatus::Completed);
    assert_eq!(streaming.content(), "Hello");
    assert_eq!(streaming.usage, Some(Usage::new(5, 2)));
    assert_eq!(streaming.finish_reason, Some(FinishReason::Stop));

    let received = server.received_requests().await.unwrap();
    let body: Value = received[0].body_json().unwrap();
    assert_eq!(body["messages"][0]["role"], json!("system"));
    assert_eq!(body["messages"][1]["content"], json!("hi"));
}
