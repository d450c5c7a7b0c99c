// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! LLM module for parley
//!
//! Wire types, the streaming transport, and the retry/timeout decorators
//! around it.

pub mod chunk;
pub mod message;
pub mod mock_transport;
pub mod request;
pub mod retry;
pub mod timeout;
pub mod transport;
pub mod usage;

pub use chunk::{FinishReason, ResponseChunk, ToolCallDelta};
pub use message::*;
pub use request::ChatRequest;
pub use transport::{ChatTransport, ChunkStream, FetchHooks, HttpTransport, ResilientTransport};
pub use usage::Usage;
