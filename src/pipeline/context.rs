// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Pipeline context
//!
//! Each stage adds its output to a `PipelineContext`: the prepared chat, the
//! request that was sent, and the streaming result. Snapshots carry a clone
//! of it to subscribers.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::confirmation::PendingConfirmation;
use super::parser::{ParseResult, ParserState, ToolCall};
use super::segments::{SegmentKind, Segments};
use super::tools::ToolResultRecord;
use crate::error::{ParleyError, Result};
use crate::llm::chunk::FinishReason;
use crate::llm::message::{ChatMessage, ToolDefinition};
use crate::llm::request::ChatRequest;
use crate::llm::usage::Usage;

/// Conversation ready to be turned into a request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedChat {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    /// Provider account the model belongs to
    pub account: Option<String>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

impl PreparedChat {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            model: model.into(),
            account: None,
            system_prompt: None,
            tools: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A prepared chat plus the outbound request and the submission's token
#[derive(Debug, Clone, Serialize)]
pub struct RequestReadyChat {
    pub prepared: Arc<PreparedChat>,
    pub request: ChatRequest,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl RequestReadyChat {
    /// New request with `extra` appended to the conversation. The original
    /// stays untouched.
    pub fn continuation(&self, extra: Vec<ChatMessage>) -> RequestReadyChat {
        let mut request = self.request.clone();
        request.messages.extend(extra);
        RequestReadyChat {
            prepared: Arc::clone(&self.prepared),
            request,
            cancel: self.cancel.clone(),
        }
    }
}

/// Everything the stream has produced so far
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamingContext {
    pub segments: Segments,
    /// Tool calls of the current turn
    pub tool_calls: Vec<ToolCall>,
    /// Text content of the current turn
    pub turn_content: String,
    /// Results of every executed turn, in order
    pub tool_results: Vec<ToolResultRecord>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    pub pending_confirmations: Vec<PendingConfirmation>,
    /// Ids of tool calls currently executing
    pub running_tools: Vec<String>,
    pub parser_state: ParserState,
    /// Number of provider round trips started
    pub turns: u32,
    pub cancelled: bool,
}

impl StreamingContext {
    /// Reset per-turn fields before a new request is streamed
    pub fn begin_turn(&mut self) {
        self.tool_calls.clear();
        self.turn_content.clear();
        self.finish_reason = None;
        self.parser_state = ParserState::default();
        self.pending_confirmations.clear();
        self.running_tools.clear();
        self.turns += 1;
    }

    /// Fold one parse result in. Returns whether visible output changed.
    pub fn apply(&mut self, result: ParseResult, state: ParserState) -> bool {
        let before = self.segments.clone();
        self.turn_content.push_str(&result.content_delta);
        self.segments = self
            .segments
            .append(&result.reasoning_delta, SegmentKind::Reasoning)
            .append(&result.content_delta, SegmentKind::Text);
        let calls_changed = result.tool_calls != self.tool_calls;
        self.tool_calls = result.tool_calls;
        self.parser_state = state;
        calls_changed || !self.segments.ptr_eq(&before)
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage
            .get_or_insert_with(Usage::default)
            .accumulate(usage);
    }

    pub fn content(&self) -> String {
        self.segments.joined(SegmentKind::Text)
    }

    pub fn reasoning(&self) -> String {
        self.segments.joined(SegmentKind::Reasoning)
    }
}

/// Snapshot of a run's stage outputs
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineContext {
    pub submission_id: String,
    pub prepared: Option<Arc<PreparedChat>>,
    pub request: Option<Arc<RequestReadyChat>>,
    pub streaming: Option<StreamingContext>,
}

impl PipelineContext {
    pub fn builder(submission_id: impl Into<String>) -> PipelineContextBuilder {
        PipelineContextBuilder::new(submission_id)
    }

    pub fn require_prepared(&self) -> Result<&Arc<PreparedChat>> {
        self.prepared
            .as_ref()
            .ok_or_else(|| ParleyError::Preparation("chat has not been prepared".into()))
    }

    pub fn require_request(&self) -> Result<&Arc<RequestReadyChat>> {
        self.request
            .as_ref()
            .ok_or_else(|| ParleyError::Preparation("request has not been built".into()))
    }

    pub fn require_streaming(&self) -> Result<&StreamingContext> {
        self.streaming
            .as_ref()
            .ok_or_else(|| ParleyError::Preparation("no streaming result".into()))
    }
}

/// Accumulates stage outputs into a `PipelineContext`
#[derive(Debug, Clone, Default)]
pub struct PipelineContextBuilder {
    context: PipelineContext,
}

impl PipelineContextBuilder {
    pub fn new(submission_id: impl Into<String>) -> Self {
        Self {
            context: PipelineContext {
                submission_id: submission_id.into(),
                ..Default::default()
            },
        }
    }

    pub fn with_prepared(mut self, prepared: Arc<PreparedChat>) -> Self {
        self.context.prepared = Some(prepared);
        self
    }

    pub fn with_request_ready(mut self, request: Arc<RequestReadyChat>) -> Self {
        self.context.prepared = Some(Arc::clone(&request.prepared));
        self.context.request = Some(request);
        self
    }

    pub fn with_streaming(mut self, streaming: StreamingContext) -> Self {
        self.context.streaming = Some(streaming);
        self
    }

    pub fn streaming_mut(&mut self) -> &mut StreamingContext {
        self.context.streaming.get_or_insert_with(StreamingContext::default)
    }

    pub fn set_request_ready(&mut self, request: Arc<RequestReadyChat>) {
        self.context.prepared = Some(Arc::clone(&request.prepared));
        self.context.request = Some(request);
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> PipelineContext {
        self.context.clone()
    }

    pub fn build(self) -> PipelineContext {
        self.context
    }
}
