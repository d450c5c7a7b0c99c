// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Incremental chunk parser
//!
//! Turns one `ResponseChunk` at a time into content, reasoning and tool-call
//! deltas. Models that inline their reasoning wrap it in `<think>...</think>`;
//! the first such span is routed to reasoning and everything after it is
//! plain content. Tag markers can be split across chunks at any byte, so a
//! trailing fragment that could still become a marker is held in
//! `ParserState::pending` until the next chunk (or `flush`) decides it.
//!
//! All cross-chunk state lives in `ParserState`; `parse_chunk` is a pure
//! function of `(chunk, calls, state)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ParleyError, Result};
use crate::llm::chunk::{ResponseChunk, ToolCallDelta};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Where the parser is relative to the think span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkTagState {
    /// No `<think>` seen yet
    #[default]
    NoThink,
    /// Inside the first think span
    InThink,
    /// The first span has closed; tags are plain text from here on
    EndThink,
}

/// Cross-chunk parser state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParserState {
    pub think: ThinkTagState,
    /// Held-back text that may be the start of a tag marker
    pub pending: String,
}

/// A tool invocation accumulated from streamed deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub index: usize,
    pub name: String,
    /// Raw JSON text, append-only while streaming
    pub arguments: String,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, index: usize, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index,
            name: name.into(),
            arguments: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Parse the accumulated arguments. Empty text means `{}`.
    pub fn parsed_arguments(&self) -> Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            ParleyError::Parse(format!(
                "invalid arguments for tool call {} ({}): {e}",
                self.id, self.name
            ))
        })
    }
}

/// Output of parsing one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub content_delta: String,
    pub reasoning_delta: String,
    /// Full accumulated tool-call list after this chunk
    pub tool_calls: Vec<ToolCall>,
    /// A `<think>` tag has been seen in this response
    pub has_think_tag: bool,
    pub is_in_think_tag: bool,
}

/// Parse one chunk against the accumulated tool calls and parser state.
pub fn parse_chunk(
    chunk: &ResponseChunk,
    calls: &[ToolCall],
    state: &ParserState,
) -> (ParseResult, ParserState) {
    let mut result = ParseResult::default();
    let mut next = state.clone();

    if let Some(reasoning) = &chunk.reasoning {
        result.reasoning_delta.push_str(reasoning);
    }

    if let Some(content) = &chunk.content {
        let text = std::mem::take(&mut next.pending) + content;
        split_think_tags(&text, &mut next, &mut result);
    }

    result.tool_calls = merge_tool_calls(calls, &chunk.tool_calls);
    result.has_think_tag = next.think != ThinkTagState::NoThink;
    result.is_in_think_tag = next.think == ThinkTagState::InThink;
    (result, next)
}

/// Release held-back text at stream end.
pub fn flush_state(calls: &[ToolCall], state: &ParserState) -> (ParseResult, ParserState) {
    let mut result = ParseResult {
        tool_calls: calls.to_vec(),
        ..Default::default()
    };
    let mut next = state.clone();
    let pending = std::mem::take(&mut next.pending);
    match next.think {
        ThinkTagState::InThink => result.reasoning_delta = pending,
        ThinkTagState::NoThink | ThinkTagState::EndThink => result.content_delta = pending,
    }
    result.has_think_tag = next.think != ThinkTagState::NoThink;
    result.is_in_think_tag = next.think == ThinkTagState::InThink;
    (result, next)
}

fn split_think_tags(text: &str, state: &mut ParserState, result: &mut ParseResult) {
    let mut rest = text;
    loop {
        match state.think {
            ThinkTagState::NoThink => match rest.find(THINK_OPEN) {
                Some(at) => {
                    result.content_delta.push_str(&rest[..at]);
                    rest = &rest[at + THINK_OPEN.len()..];
                    state.think = ThinkTagState::InThink;
                }
                None => {
                    let keep = partial_marker_len(rest, THINK_OPEN);
                    let (emit, hold) = rest.split_at(rest.len() - keep);
                    result.content_delta.push_str(emit);
                    state.pending = hold.to_string();
                    return;
                }
            },
            ThinkTagState::InThink => match rest.find(THINK_CLOSE) {
                Some(at) => {
                    result.reasoning_delta.push_str(&rest[..at]);
                    rest = &rest[at + THINK_CLOSE.len()..];
                    state.think = ThinkTagState::EndThink;
                }
                None => {
                    let keep = partial_marker_len(rest, THINK_CLOSE);
                    let (emit, hold) = rest.split_at(rest.len() - keep);
                    result.reasoning_delta.push_str(emit);
                    state.pending = hold.to_string();
                    return;
                }
            },
            ThinkTagState::EndThink => {
                result.content_delta.push_str(rest);
                return;
            }
        }
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&len| text.ends_with(&marker[..len]))
        .unwrap_or(0)
}

fn merge_tool_calls(calls: &[ToolCall], deltas: &[ToolCallDelta]) -> Vec<ToolCall> {
    let mut merged = calls.to_vec();

    for delta in deltas {
        let position = delta
            .index
            .and_then(|index| merged.iter().position(|c| c.index == index))
            .or_else(|| {
                delta
                    .id
                    .as_deref()
                    .and_then(|id| merged.iter().position(|c| c.id == id))
            });

        match position {
            Some(position) => {
                let call = &mut merged[position];
                if let Some(args) = &delta.arguments {
                    call.arguments.push_str(args);
                }
                if call.name.is_empty() {
                    if let Some(name) = &delta.name {
                        call.name = name.clone();
                    }
                }
            }
            None => {
                let index = delta.index.unwrap_or(merged.len());
                let id = delta
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
                let mut call = ToolCall::new(id, index, delta.name.clone().unwrap_or_default());
                if let Some(args) = &delta.arguments {
                    call.arguments.push_str(args);
                }
                merged.push(call);
            }
        }
    }

    merged
}

/// Stateful wrapper around `parse_chunk`
#[derive(Debug, Clone, Default)]
pub struct ChunkParser {
    state: ParserState,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, chunk: &ResponseChunk, calls: &[ToolCall]) -> ParseResult {
        let (result, next) = parse_chunk(chunk, calls, &self.state);
        self.state = next;
        result
    }

    pub fn flush(&mut self, calls: &[ToolCall]) -> ParseResult {
        let (result, next) = flush_state(calls, &self.state);
        self.state = next;
        result
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn set_state(&mut self, state: ParserState) {
        self.state = state;
    }

    pub fn reset(&mut self) {
        self.state = ParserState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed(parser: &mut ChunkParser, pieces: &[&str]) -> (String, String) {
        let mut content = String::new();
        let mut reasoning = String::new();
        for piece in pieces {
            let result = parser.parse(&ResponseChunk::content(*piece), &[]);
            content.push_str(&result.content_delta);
            reasoning.push_str(&result.reasoning_delta);
        }
        let result = parser.flush(&[]);
        content.push_str(&result.content_delta);
        reasoning.push_str(&result.reasoning_delta);
        (content, reasoning)
    }

    #[test]
    fn test_plain_content_passes_through() {
        let mut parser = ChunkParser::new();
        let result = parser.parse(&ResponseChunk::content("Hello"), &[]);
        assert_eq!(result.content_delta, "Hello");
        assert!(result.reasoning_delta.is_empty());
        assert!(!result.has_think_tag);
    }

    #[test]
    fn test_reasoning_field_goes_to_reasoning() {
        let mut parser = ChunkParser::new();
        let result = parser.parse(&ResponseChunk::reasoning("pondering"), &[]);
        assert_eq!(result.reasoning_delta, "pondering");
        assert!(result.content_delta.is_empty());
    }

    #[test]
    fn test_think_span_in_one_chunk() {
        let mut parser = ChunkParser::new();
        let result = parser.parse(&ResponseChunk::content("<think>plan</think>answer"), &[]);
        assert_eq!(result.reasoning_delta, "plan");
        assert_eq!(result.content_delta, "answer");
        assert!(result.has_think_tag);
        assert!(!result.is_in_think_tag);
        assert_eq!(parser.state().think, ThinkTagState::EndThink);
    }

    #[test]
    fn test_open_tag_split_across_chunks() {
        let mut parser = ChunkParser::new();
        let first = parser.parse(&ResponseChunk::content("Hi <thi"), &[]);
        assert_eq!(first.content_delta, "Hi ");
        assert_eq!(parser.state().pending, "<thi");

        let second = parser.parse(&ResponseChunk::content("nk>deep"), &[]);
        assert!(second.content_delta.is_empty());
        assert_eq!(second.reasoning_delta, "deep");
        assert!(second.is_in_think_tag);
    }

    #[test]
    fn test_close_tag_split_across_chunks() {
        let (content, reasoning) = feed(
            &mut ChunkParser::new(),
            &["<think>a", "b</", "thi", "nk>c"],
        );
        assert_eq!(reasoning, "ab");
        assert_eq!(content, "c");
    }

    #[test]
    fn test_only_first_think_span_is_reasoning() {
        let (content, reasoning) = feed(
            &mut ChunkParser::new(),
            &["<think>one</think>x<think>two</think>"],
        );
        assert_eq!(reasoning, "one");
        assert_eq!(content, "x<think>two</think>");
    }

    #[test]
    fn test_false_partial_tag_is_released() {
        let mut parser = ChunkParser::new();
        let first = parser.parse(&ResponseChunk::content("a <"), &[]);
        assert_eq!(first.content_delta, "a ");
        let second = parser.parse(&ResponseChunk::content("b"), &[]);
        assert_eq!(second.content_delta, "<b");
    }

    #[test]
    fn test_flush_releases_pending_text() {
        let mut parser = ChunkParser::new();
        parser.parse(&ResponseChunk::content("done <th"), &[]);
        let flushed = parser.flush(&[]);
        assert_eq!(flushed.content_delta, "<th");
        assert!(parser.state().pending.is_empty());

        let mut parser = ChunkParser::new();
        parser.parse(&ResponseChunk::content("<think>hmm</thin"), &[]);
        let flushed = parser.flush(&[]);
        assert_eq!(flushed.reasoning_delta, "</thin");
    }

    #[test]
    fn test_tool_call_deltas_accumulate_by_index() {
        let mut parser = ChunkParser::new();
        let first = parser.parse(
            &ResponseChunk::tool_call(0, Some("call_1"), Some("shell"), Some("{\"cmd\":")),
            &[],
        );
        assert_eq!(first.tool_calls.len(), 1);
        assert!(first.content_delta.is_empty());
        assert!(first.reasoning_delta.is_empty());

        let second = parser.parse(
            &ResponseChunk::tool_call(0, None, None, Some("\"ls\"}")),
            &first.tool_calls,
        );
        assert_eq!(second.tool_calls.len(), 1);
        assert_eq!(second.tool_calls[0].id, "call_1");
        assert_eq!(second.tool_calls[0].name, "shell");
        assert_eq!(second.tool_calls[0].arguments, "{\"cmd\":\"ls\"}");
        assert_eq!(
            second.tool_calls[0].parsed_arguments().unwrap()["cmd"],
            "ls"
        );
    }

    #[test]
    fn test_tool_call_matched_by_id_without_index() {
        let existing = vec![ToolCall::new("call_x", 0, "read")];
        let chunk = ResponseChunk {
            tool_calls: vec![ToolCallDelta {
                index: None,
                id: Some("call_x".to_string()),
                name: None,
                arguments: Some("{}".to_string()),
            }],
            ..Default::default()
        };
        let (result, _) = parse_chunk(&chunk, &existing, &ParserState::default());
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].arguments, "{}");
    }

    #[test]
    fn test_new_index_creates_call_with_generated_id() {
        let existing = vec![ToolCall::new("call_a", 0, "read")];
        let chunk = ResponseChunk::tool_call(1, None, Some("write"), None);
        let (result, _) = parse_chunk(&chunk, &existing, &ParserState::default());
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.tool_calls[1].index, 1);
        assert!(result.tool_calls[1].id.starts_with("call_"));
        assert_ne!(result.tool_calls[1].id, "call_a");
    }

    #[test]
    fn test_parse_chunk_does_not_mutate_inputs() {
        let state = ParserState {
            think: ThinkTagState::NoThink,
            pending: "<".to_string(),
        };
        let calls = vec![ToolCall::new("call_a", 0, "read")];
        let chunk = ResponseChunk::tool_call(0, None, None, Some("{"));
        let (_, next) = parse_chunk(&chunk, &calls, &state);
        assert_eq!(state.pending, "<");
        assert_eq!(calls[0].arguments, "");
        assert_eq!(next.pending, "<");
    }

    #[test]
    fn test_state_export_import_reset() {
        let mut parser = ChunkParser::new();
        parser.parse(&ResponseChunk::content("<think>a"), &[]);
        let saved = parser.state().clone();
        let json = serde_json::to_string(&saved).unwrap();
        let restored: ParserState = serde_json::from_str(&json).unwrap();

        let mut other = ChunkParser::new();
        other.set_state(restored);
        let result = other.parse(&ResponseChunk::content("b</think>c"), &[]);
        assert_eq!(result.reasoning_delta, "b");
        assert_eq!(result.content_delta, "c");

        other.reset();
        assert_eq!(other.state(), &ParserState::default());
    }

    #[test]
    fn test_parsed_arguments_empty_and_invalid() {
        let mut call = ToolCall::new("c", 0, "t");
        assert_eq!(call.parsed_arguments().unwrap(), serde_json::json!({}));
        call.arguments = "{oops".to_string();
        assert!(matches!(call.parsed_arguments(), Err(ParleyError::Parse(_))));
    }

    /// Reference split over the whole text at once
    fn split_whole(text: &str) -> (String, String) {
        match text.find(THINK_OPEN) {
            None => (text.to_string(), String::new()),
            Some(open) => {
                let before = &text[..open];
                let rest = &text[open + THINK_OPEN.len()..];
                match rest.find(THINK_CLOSE) {
                    None => (before.to_string(), rest.to_string()),
                    Some(close) => (
                        format!("{before}{}", &rest[close + THINK_CLOSE.len()..]),
                        rest[..close].to_string(),
                    ),
                }
            }
        }
    }

    fn text_strategy() -> impl Strategy<Value = String> {
        let piece = prop::sample::select(vec![
            "a", "b", " ", "<", "/", ">", "t", "think", "<think>", "</think>", "\n",
        ]);
        prop::collection::vec(piece, 0..40).prop_map(|pieces| pieces.concat())
    }

    proptest! {
        #[test]
        fn test_any_chunking_reconstructs_text(
            text in text_strategy(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(text.len() + 1)).collect();
            points.push(0);
            points.push(text.len());
            points.sort_unstable();
            points.dedup();
            let pieces: Vec<&str> = points.windows(2).map(|w| &text[w[0]..w[1]]).collect();

            let (content, reasoning) = feed(&mut ChunkParser::new(), &pieces);
            let (expected_content, expected_reasoning) = split_whole(&text);
            prop_assert_eq!(content, expected_content);
            prop_assert_eq!(reasoning, expected_reasoning);
        }
    }
}
