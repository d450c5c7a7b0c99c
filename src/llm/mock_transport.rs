// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Mock chat transport for testing
//!
//! Replays scripted chunk sequences without making network calls. Each call
//! to `send` consumes the next scripted turn; once the script runs out, a
//! plain `stop` turn is returned.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::chunk::{FinishReason, ResponseChunk};
use super::request::ChatRequest;
use super::transport::{ChatTransport, ChunkStream};
use crate::error::{ParleyError, Result};

/// One step of a scripted response stream
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Yield a chunk
    Chunk(ResponseChunk),
    /// Sleep before the next step
    Delay(Duration),
    /// Fail the stream with a network error
    Fail(String),
    /// Block until the request is cancelled
    Hang,
}

/// A mock transport for testing
#[derive(Clone, Default)]
pub struct MockTransport {
    turns: Arc<Mutex<VecDeque<Vec<MockStep>>>>,
    send_failures: Arc<AtomicUsize>,
    call_count: Arc<AtomicUsize>,
    recorded_requests: Arc<Mutex<Vec<ChatRequest>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Mock transport lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn made of plain chunks
    pub fn with_chunks(self, chunks: Vec<ResponseChunk>) -> Self {
        self.with_steps(chunks.into_iter().map(MockStep::Chunk).collect())
    }

    /// Queue a turn made of arbitrary steps
    pub fn with_steps(self, steps: Vec<MockStep>) -> Self {
        lock(&self.turns).push_back(steps);
        self
    }

    /// Queue a text reply split into the given pieces, ending with `stop`
    pub fn with_text_reply(self, pieces: &[&str]) -> Self {
        let mut chunks: Vec<ResponseChunk> =
            pieces.iter().map(|p| ResponseChunk::content(*p)).collect();
        chunks.push(ResponseChunk::finish(FinishReason::Stop));
        self.with_chunks(chunks)
    }

    /// Queue a turn requesting a single tool call
    pub fn with_tool_call(self, id: &str, name: &str, arguments: &str) -> Self {
        self.with_chunks(vec![
            ResponseChunk::tool_call(0, Some(id), Some(name), Some(arguments)),
            ResponseChunk::finish(FinishReason::ToolCalls),
        ])
    }

    /// Make the next `count` calls to `send` fail before streaming
    pub fn with_send_failures(self, count: usize) -> Self {
        self.send_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        lock(&self.recorded_requests).clone()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        lock(&self.recorded_requests).last().cloned()
    }

    fn next_turn(&self) -> Vec<MockStep> {
        lock(&self.turns)
            .pop_front()
            .unwrap_or_else(|| vec![MockStep::Chunk(ResponseChunk::finish(FinishReason::Stop))])
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChunkStream> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.recorded_requests).push(request.clone());

        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }

        let remaining = self.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.send_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ParleyError::Network("mock connection reset".to_string()));
        }

        let steps = self.next_turn();
        let cancel = cancel.clone();
        let stream = async_stream::try_stream! {
            for step in steps {
                match step {
                    MockStep::Chunk(chunk) => {
                        if cancel.is_cancelled() {
                            Err::<(), ParleyError>(ParleyError::Cancelled)?;
                        }
                        yield chunk;
                    }
                    MockStep::Delay(duration) => {
                        let cancelled = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(duration) => false,
                        };
                        if cancelled {
                            Err::<(), ParleyError>(ParleyError::Cancelled)?;
                        }
                    }
                    MockStep::Fail(message) => {
                        Err::<(), ParleyError>(ParleyError::Network(message))?;
                    }
                    MockStep::Hang => {
                        cancel.cancelled().await;
                        Err::<(), ParleyError>(ParleyError::Cancelled)?;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
