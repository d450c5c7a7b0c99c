// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Error types for parley
//!
//! Every failure in the pipeline maps onto one `ParleyError` variant, and each
//! variant carries a coarse `ErrorKind` tag so callers never have to sniff
//! messages to tell a cancellation from a real failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for parley operations
#[derive(Error, Debug)]
pub enum ParleyError {
    /// The submission was cancelled through its cancellation token
    #[error("Request aborted")]
    Cancelled,

    /// An operation did not finish before its deadline
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Network connectivity error (connection refused/reset, broken stream)
    #[error("Network error: {0}")]
    Network(String),

    /// Provider answered with a non-success HTTP status
    #[error("API error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A tool handler failed
    #[error("Tool \"{tool}\" execution failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The finalization collaborator failed after streaming succeeded
    #[error("Finalization failed: {0}")]
    Finalization(String),

    /// A chunk or tool-call argument payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// `start()` was called while a previous run is still active
    #[error("Chat pipeline is already running")]
    AlreadyRunning,

    /// The preparation collaborator failed
    #[error("Preparation failed: {0}")]
    Preparation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a `ParleyError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    Timeout,
    Network,
    ToolExecution,
    Finalization,
    Parse,
    Other,
}

impl ParleyError {
    /// Tag used by the state machine and retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParleyError::Cancelled => ErrorKind::Cancelled,
            ParleyError::Timeout { .. } => ErrorKind::Timeout,
            ParleyError::Network(_) => ErrorKind::Network,
            ParleyError::Server { status, .. } if *status >= 500 => ErrorKind::Network,
            ParleyError::ToolExecution { .. } => ErrorKind::ToolExecution,
            ParleyError::Finalization(_) => ErrorKind::Finalization,
            ParleyError::Parse(_) => ErrorKind::Parse,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ParleyError::Cancelled)
    }

    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ParleyError::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ParleyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report the configured duration
            ParleyError::Timeout { timeout_ms: 0 }
        } else if let Some(status) = err.status() {
            ParleyError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ParleyError::Network(err.to_string())
        }
    }
}

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, ParleyError>;
