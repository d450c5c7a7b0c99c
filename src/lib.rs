// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! parley - streaming chat submission pipeline for LLM providers.
//!
//! Architecture highlights:
//! - `pipeline`: state machine, chunk parser, segment builder, tool-call
//!   confirmation gate, and the context carried in snapshots
//! - `llm`: wire types, usage extraction, the SSE transport, and the retry and
//!   timeout decorators around it
//! - `config`: JSON settings under `~/.parley`
//! - `cli`: arguments for the `parley` binary

pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;

pub use error::{ParleyError, Result};
