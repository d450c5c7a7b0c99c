// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Outbound chat-completion request

use serde::{Deserialize, Serialize};

use super::message::{ChatMessage, ToolDefinition};

/// Request payload for `POST /v1/chat/completions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            tools: Vec::new(),
            stream: true,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// JSON body in OpenAI wire format. The system prompt goes first.
    pub fn to_body(&self) -> serde_json::Value {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = self.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.extend(
            self.messages
                .iter()
                .filter_map(|m| serde_json::to_value(m).ok()),
        );

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": self.stream,
        });

        if self.stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !self.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                self.tools.iter().map(ToolDefinition::to_wire).collect(),
            );
            body["tool_choice"] = serde_json::json!("auto");
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_puts_system_first() {
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")]).with_system("be brief");
        let body = request.to_body();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_body_omits_tools_when_empty() {
        let body = ChatRequest::new("m", vec![]).with_stream(false).to_body();
        assert!(body.get("tools").is_none());
        assert!(body.get("stream_options").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_body_includes_tools_and_sampling() {
        let request = ChatRequest::new("m", vec![ChatMessage::user("x")])
            .with_tools(vec![ToolDefinition::new("shell", "run", json!({"type": "object"}))])
            .with_temperature(0.5)
            .with_max_tokens(100);
        let body = request.to_body();
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["max_tokens"], 100);
        assert!((body["temperature"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }
}
