// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Chat submission pipeline
//!
//! - `parser`: think-tag aware chunk parsing and tool-call delta merging
//! - `segments`: ordered text/reasoning segment list
//! - `confirmation`: gate that parks risky tool calls until a decision arrives
//! - `tools`: tool registry seam and the concurrent runner
//! - `context`: per-stage outputs carried in snapshots
//! - `collaborators`: preparation, request building and finalization seams
//! - `machine`: the state machine tying them together

pub mod collaborators;
pub mod confirmation;
pub mod context;
pub mod machine;
pub mod parser;
pub mod segments;
pub mod tools;

pub use collaborators::{
    ChatPreparer, DefaultRequestBuilder, Finalizer, LogFinalizer, PrepareParams, RequestBuilder,
    StaticPreparer,
};
pub use confirmation::{
    ConfirmationDecision, ConfirmationEvent, ConfirmationGate, PendingConfirmation, RiskAssessment,
    RiskLevel,
};
pub use context::{PipelineContext, PreparedChat, RequestReadyChat, StreamingContext};
pub use machine::{
    ChatPipeline, PipelineOptions, PipelineSnapshot, PipelineStatus, SnapshotError, Subscription,
};
pub use parser::{ChunkParser, ParseResult, ParserState, ThinkTagState, ToolCall};
pub use segments::{Segment, SegmentKind, Segments};
pub use tools::{
    CommandRiskPolicy, NoTools, ToolOutput, ToolProgress, ToolRegistry, ToolResultRecord,
    ToolRunner, ToolStatus,
};
