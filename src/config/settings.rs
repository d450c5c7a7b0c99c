// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Settings management for parley
//!
//! Handles loading and saving settings from ~/.parley/settings.json

use serde::{Deserialize, Serialize};

mod io;
mod validation;

/// Main settings structure, stored in ~/.parley/settings.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Provider endpoint and model selection
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Retry/timeout behaviour around the network call
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Tool execution and confirmation settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL; `/v1/chat/completions` is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (prefer the env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable consulted before `api_key`
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with each request
    #[serde(default = "default_model")]
    pub model: String,

    /// Whether to request an SSE stream
    #[serde(default = "default_true")]
    pub stream: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            stream: true,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Which failures the transport retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry every failure except cancellation
    Always,
    /// Retry only failures classified by `is_retriable_error`
    #[default]
    RetriableOnly,
    /// Single attempt
    Never,
}

/// Resilience settings for provider requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after each attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Maximum delay in milliseconds (cap for backoff)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Deadline for establishing a response (headers), in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether `is_retriable_error` gates retries
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Tool execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Maximum tool calls executed concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum request/tool round trips in one submission
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Seconds before an unanswered confirmation is rejected
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Skip confirmation for risky calls (trust mode)
    #[serde(default)]
    pub auto_approve: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_tool_rounds: default_max_tool_rounds(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            auto_approve: false,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_api_key_env() -> String {
    "PARLEY_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10000
}

fn default_request_timeout_ms() -> u64 {
    60000
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_tool_rounds() -> u32 {
    25
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}
