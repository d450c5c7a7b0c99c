// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Streaming transport to an OpenAI-compatible chat-completions endpoint
//!
//! `ChatTransport::send` turns one `ChatRequest` into a lazy stream of
//! `ResponseChunk`s. Streaming responses are decoded from SSE as bytes
//! arrive; non-streaming responses produce a single chunk. Every transport
//! honours the submission's `CancellationToken`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::chunk::{decode_sse_data, ResponseChunk};
use super::request::ChatRequest;
use super::retry::{is_retriable_error, with_retry, with_retry_when, RetryConfig};
use super::timeout::with_timeout_cancellable;
use crate::config::settings::{ResilienceConfig, RetryPolicy, Settings};
use crate::error::{ParleyError, Result};

/// Lazy, single-pass sequence of decoded response chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk>> + Send>>;

/// Network boundary of the pipeline
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a request and return its chunk stream once the response has
    /// started.
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChunkStream>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChunkStream> {
        (**self).send(request, cancel).await
    }
}

/// Callbacks bracketing the network request (until response headers)
pub trait FetchHooks: Send + Sync {
    fn before_fetch(&self) {}
    fn after_fetch(&self) {}
}

/// Fires `before_fetch` on creation and `after_fetch` on drop, so the pair
/// runs exactly once per request on every exit path.
struct FetchGuard {
    hooks: Option<Arc<dyn FetchHooks>>,
}

impl FetchGuard {
    fn new(hooks: Option<Arc<dyn FetchHooks>>) -> Self {
        if let Some(hooks) = &hooks {
            hooks.before_fetch();
        }
        Self { hooks }
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if let Some(hooks) = &self.hooks {
            hooks.after_fetch();
        }
    }
}

/// HTTP transport for `POST {base_url}/v1/chat/completions`
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    hooks: Option<Arc<dyn FetchHooks>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            hooks: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.provider.base_url.clone(), settings.api_key())
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn post(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let _guard = FetchGuard::new(self.hooks.clone());

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&request.to_body());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(
            target: "parley.llm.transport",
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat request"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(
                target: "parley.llm.transport",
                status = status.as_u16(),
                "provider returned error status"
            );
            return Err(ParleyError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChunkStream> {
        let response = self.post(request, cancel).await?;

        if !request.stream {
            let raw: serde_json::Value = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
                body = response.json() => body?,
            };
            let mut chunk = ResponseChunk::from_completion_value(&raw);
            if chunk.model.is_none() {
                chunk.model = Some(request.model.clone());
            }
            return Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })));
        }

        Ok(sse_chunks(
            response.bytes_stream(),
            cancel.clone(),
            request.model.clone(),
        ))
    }
}

/// Decode an SSE byte stream into response chunks.
///
/// Lines are split on `\n` at the byte level so multi-byte characters spanning
/// network reads survive. Malformed `data:` payloads are logged and skipped.
pub fn sse_chunks<S, B, E>(bytes: S, cancel: CancellationToken, model: String) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        while !finished {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ParleyError::Cancelled),
                item = bytes.next() => Ok(item),
            };

            match next? {
                Some(item) => {
                    let item = item.map_err(|e| ParleyError::Network(e.to_string()))?;
                    buffer.extend_from_slice(item.as_ref());
                }
                None => {
                    // Flush a final line that lacked a newline.
                    if !buffer.is_empty() {
                        buffer.push(b'\n');
                    }
                    finished = true;
                }
            }

            while let Some(line_end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=line_end).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };

                match decode_sse_data(data, Some(&model)) {
                    Ok(Some(chunk)) => {
                        if cancel.is_cancelled() {
                            Err::<(), ParleyError>(ParleyError::Cancelled)?;
                        }
                        yield chunk;
                    }
                    Ok(None) => {
                        finished = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "parley.llm.transport",
                            error = %e,
                            "skipping malformed stream payload"
                        );
                    }
                }
            }
        }
    };

    Box::pin(stream)
}

/// Adds retry and a response deadline to another transport.
pub struct ResilientTransport<T> {
    inner: T,
    retry: RetryConfig,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl<T: ChatTransport> ResilientTransport<T> {
    pub fn new(inner: T, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            retry: RetryConfig::from(config),
            policy: config.retry_policy,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: ChatTransport> ChatTransport for ResilientTransport<T> {
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChunkStream> {
        let inner = &self.inner;
        let timeout = self.request_timeout;
        let attempt = move || with_timeout_cancellable(inner.send(request, cancel), timeout, cancel);

        let run = async {
            match self.policy {
                RetryPolicy::Never => attempt().await,
                RetryPolicy::Always => with_retry(attempt, &self.retry).await,
                RetryPolicy::RetriableOnly => {
                    with_retry_when(attempt, &self.retry, is_retriable_error).await
                }
            }
        };

        // Backoff sleeps must not outlive a cancellation.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ParleyError::Cancelled),
            result = run => result,
        }
    }
}
