// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Token usage extraction from raw provider payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chunk::ResponseChunk;

/// Token usage statistics for one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Fold another turn's usage into this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

fn count(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

/// Pull token counts out of a raw chunk or final response.
///
/// OpenAI-style `prompt_tokens`/`completion_tokens`/`total_tokens` must all be
/// numeric. Anthropic-style `input_tokens`/`output_tokens` are accepted as a
/// fallback. Anything else yields `None`.
pub fn extract_usage(raw: &Value) -> Option<Usage> {
    let usage = raw.get("usage")?;
    if !usage.is_object() {
        return None;
    }

    if let (Some(prompt), Some(completion), Some(total)) = (
        count(usage, "prompt_tokens"),
        count(usage, "completion_tokens"),
        count(usage, "total_tokens"),
    ) {
        return Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        });
    }

    let input = count(usage, "input_tokens")?;
    let output = count(usage, "output_tokens")?;
    Some(Usage::new(input, output))
}

/// Build a chunk carrying nothing but usage, for providers that report
/// token counts in a trailing frame with no choices.
pub fn usage_only_chunk(
    raw: &Value,
    id_fallback: Option<&str>,
    model_fallback: Option<&str>,
) -> Option<ResponseChunk> {
    let usage = extract_usage(raw)?;
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or(id_fallback)
        .unwrap_or("stream");
    let model = raw
        .get("model")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or(model_fallback)
        .unwrap_or("unknown");

    Some(ResponseChunk {
        id: Some(id.to_string()),
        model: Some(model.to_string()),
        usage: Some(usage),
        ..Default::default()
    })
}
