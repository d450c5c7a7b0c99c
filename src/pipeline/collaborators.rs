// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! External collaborators of the pipeline: preparation, request building and
//! finalization.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::context::{PipelineContext, PreparedChat, RequestReadyChat};
use crate::config::settings::ProviderConfig;
use crate::error::Result;
use crate::llm::message::{ChatMessage, ToolDefinition};
use crate::llm::request::ChatRequest;

/// Payload of one submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareParams {
    pub prompt: String,
    /// Model override for this submission
    pub model: Option<String>,
}

impl PrepareParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
        }
    }
}

/// Loads history, resolves the model, and collects tool definitions
#[async_trait]
pub trait ChatPreparer: Send + Sync {
    async fn prepare(&self, params: &PrepareParams) -> Result<PreparedChat>;
}

/// Turns a prepared chat into the outbound request
pub trait RequestBuilder: Send + Sync {
    fn build_request(
        &self,
        prepared: Arc<PreparedChat>,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<RequestReadyChat>;
}

/// Persists the outcome of a successful run
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, context: &PipelineContext) -> Result<()>;
}

/// Preparer with a fixed model, system prompt and history
#[derive(Debug, Clone)]
pub struct StaticPreparer {
    model: String,
    system_prompt: Option<String>,
    history: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
}

impl StaticPreparer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            history: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl ChatPreparer for StaticPreparer {
    async fn prepare(&self, params: &PrepareParams) -> Result<PreparedChat> {
        let mut prepared = PreparedChat::new(params.model.clone().unwrap_or_else(|| self.model.clone()))
            .with_messages(self.history.clone())
            .with_tools(self.tools.clone());
        prepared.system_prompt = self.system_prompt.clone();
        Ok(prepared)
    }
}

/// Appends the prompt as a user message and copies sampling settings
#[derive(Debug, Clone)]
pub struct DefaultRequestBuilder {
    stream: bool,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl Default for DefaultRequestBuilder {
    fn default() -> Self {
        Self {
            stream: true,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl DefaultRequestBuilder {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            stream: config.stream,
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

impl RequestBuilder for DefaultRequestBuilder {
    fn build_request(
        &self,
        prepared: Arc<PreparedChat>,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<RequestReadyChat> {
        let mut messages = prepared.messages.clone();
        if !prompt.trim().is_empty() {
            messages.push(ChatMessage::user(prompt));
        }

        let mut request = ChatRequest::new(prepared.model.clone(), messages)
            .with_tools(prepared.tools.clone())
            .with_stream(self.stream);
        if let Some(system) = &prepared.system_prompt {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        Ok(RequestReadyChat {
            prepared,
            request,
            cancel,
        })
    }
}

/// Finalizer that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFinalizer;

#[async_trait]
impl Finalizer for LogFinalizer {
    async fn finalize(&self, context: &PipelineContext) -> Result<()> {
        let streaming = context.require_streaming()?;
        tracing::info!(
            target: "parley.pipeline.machine",
            submission_id = %context.submission_id,
            turns = streaming.turns,
            segments = streaming.segments.len(),
            total_tokens = streaming.usage.map(|u| u.total_tokens).unwrap_or(0),
            "submission finalized"
        );
        Ok(())
    }
}
