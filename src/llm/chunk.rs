// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Provider-neutral response chunks and their OpenAI wire decoding

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::usage::{extract_usage, usage_only_chunk, Usage};
use crate::error::{ParleyError, Result};

/// Why the provider stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    /// Map a provider-specific finish reason onto the normalised set.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "stop" | "stop_sequence" | "end_turn" | "complete" => FinishReason::Stop,
            "length" | "max_tokens" | "length_limit" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// One streamed fragment of a tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: Option<usize>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One decoded unit of provider output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl ResponseChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn tool_call(
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        Self {
            tool_calls: vec![ToolCallDelta {
                index: Some(index),
                id: id.map(String::from),
                name: name.map(String::from),
                arguments: arguments.map(String::from),
            }],
            ..Default::default()
        }
    }

    /// Decode one streaming frame (`choices[0].delta`).
    pub fn from_stream_value(raw: &Value) -> Self {
        let choice = raw.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));
        Self::from_parts(raw, delta, choice)
    }

    /// Decode a complete non-streaming response (`choices[0].message`).
    pub fn from_completion_value(raw: &Value) -> Self {
        let choice = raw.get("choices").and_then(|c| c.get(0));
        let message = choice.and_then(|c| c.get("message"));
        Self::from_parts(raw, message, choice)
    }

    fn from_parts(raw: &Value, body: Option<&Value>, choice: Option<&Value>) -> Self {
        let text = |key: &str| {
            body.and_then(|b| b.get(key))
                .and_then(Value::as_str)
                .map(String::from)
        };

        let tool_calls = body
            .and_then(|b| b.get("tool_calls"))
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .map(|(position, call)| decode_tool_call(position, call))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: raw.get("id").and_then(Value::as_str).map(String::from),
            model: raw.get("model").and_then(Value::as_str).map(String::from),
            content: text("content"),
            reasoning: text("reasoning_content").or_else(|| text("reasoning")),
            tool_calls,
            finish_reason: choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                .map(FinishReason::normalize),
            usage: extract_usage(raw),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
            && self.usage.is_none()
    }
}

fn decode_tool_call(position: usize, call: &Value) -> ToolCallDelta {
    let function = call.get("function");
    let field = |key: &str| {
        function
            .and_then(|f| f.get(key))
            .and_then(Value::as_str)
            .map(String::from)
    };
    ToolCallDelta {
        index: call
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .or(Some(position)),
        id: call.get("id").and_then(Value::as_str).map(String::from),
        name: field("name"),
        arguments: field("arguments"),
    }
}

/// Decode the payload of one SSE `data:` line.
///
/// Returns `Ok(None)` for the `[DONE]` sentinel. Frames without choices that
/// carry usage become usage-only chunks.
pub fn decode_sse_data(data: &str, model_fallback: Option<&str>) -> Result<Option<ResponseChunk>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let raw: Value =
        serde_json::from_str(data).map_err(|e| ParleyError::Parse(format!("{e}: {data}")))?;

    let has_choices = raw
        .get("choices")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty());
    if !has_choices {
        if let Some(chunk) = usage_only_chunk(&raw, None, model_fallback) {
            return Ok(Some(chunk));
        }
    }
    Ok(Some(ResponseChunk::from_stream_value(&raw)))
}
