// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Chat pipeline state machine
//!
//! One `ChatPipeline` drives one submission at a time through
//! `Preparing -> Streaming -> (ToolCall -> Preparing -> Streaming)* ->
//! Finalizing -> Completed`, ending in `Error` or `Cancelled` when things go
//! wrong. Each status change and each streaming delta is published as a
//! `PipelineSnapshot` to every subscriber, in subscription order.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::collaborators::{
    ChatPreparer, DefaultRequestBuilder, Finalizer, PrepareParams, RequestBuilder,
};
use super::confirmation::{ConfirmationEvent, ConfirmationGate};
use super::context::{PipelineContext, PipelineContextBuilder};
use super::parser::{flush_state, parse_chunk, ToolCall};
use super::tools::{NoTools, ToolProgress, ToolRegistry, ToolResultRecord, ToolRunner};
use crate::config::settings::ToolsConfig;
use crate::error::{ErrorKind, ParleyError, Result};
use crate::llm::message::{ChatMessage, FunctionCall, MessageToolCall};
use crate::llm::request::ChatRequest;
use crate::llm::transport::ChatTransport;
use crate::llm::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Preparing,
    Streaming,
    ToolCall,
    Finalizing,
    Completed,
    Error,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Error | PipelineStatus::Cancelled
        )
    }
}

/// Cloneable description of the error that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ParleyError> for SnapshotError {
    fn from(error: &ParleyError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub status: PipelineStatus,
    pub context: PipelineContext,
    pub error: Option<SnapshotError>,
    /// Increases by one with every published snapshot
    pub sequence: u64,
}

/// Run-level limits and confirmation behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub max_concurrency: usize,
    pub max_tool_rounds: u32,
    pub confirmation_timeout: Duration,
    pub auto_approve: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&ToolsConfig::default())
    }
}

impl From<&ToolsConfig> for PipelineOptions {
    fn from(config: &ToolsConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            max_tool_rounds: config.max_tool_rounds,
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
            auto_approve: config.auto_approve,
        }
    }
}

struct Hub {
    current: PipelineSnapshot,
    subscribers: Vec<(u64, mpsc::UnboundedSender<PipelineSnapshot>)>,
    next_subscriber: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "parley.pipeline.machine",
                "pipeline lock was poisoned, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Receives snapshots until dropped
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<PipelineSnapshot>,
    hub: Weak<Mutex<Hub>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PipelineSnapshot> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PipelineSnapshot> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            lock(&hub).subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

struct ActiveRun {
    token: CancellationToken,
    gate: ConfirmationGate,
}

/// Owns the active-run slot for one `start` call. `finish` publishes the
/// terminal snapshot and frees the slot under the same lock; dropping the
/// guard unfinished (the `start` future was dropped mid-run) publishes
/// `Cancelled` instead.
struct ActiveGuard<'a> {
    pipeline: &'a ChatPipeline,
    token: CancellationToken,
    finished: bool,
}

impl ActiveGuard<'_> {
    fn finish(
        mut self,
        status: PipelineStatus,
        context: PipelineContext,
        error: Option<SnapshotError>,
    ) {
        self.token.cancel();
        let mut active = lock(&self.pipeline.active);
        self.pipeline.publish(status, context, error);
        *active = None;
        self.finished = true;
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        if self.finished {
            return;
        }

        tracing::info!(
            target: "parley.pipeline.machine",
            "submission dropped before completion"
        );
        let mut active = lock(&self.pipeline.active);
        let mut context = self.pipeline.snapshot().context;
        if let Some(streaming) = context.streaming.as_mut() {
            streaming.cancelled = true;
            streaming.pending_confirmations.clear();
            streaming.running_tools.clear();
        }
        self.pipeline.publish(
            PipelineStatus::Cancelled,
            context,
            Some(SnapshotError::from(&ParleyError::Cancelled)),
        );
        *active = None;
    }
}

/// Orchestrates chat submissions. Share it behind an `Arc` so `cancel` and
/// `resolve_confirmation` can be called while `start` is running.
pub struct ChatPipeline {
    transport: Arc<dyn ChatTransport>,
    preparer: Arc<dyn ChatPreparer>,
    request_builder: Arc<dyn RequestBuilder>,
    finalizer: Arc<dyn Finalizer>,
    tools: Arc<dyn ToolRegistry>,
    options: PipelineOptions,
    hub: Arc<Mutex<Hub>>,
    active: Mutex<Option<ActiveRun>>,
}

impl ChatPipeline {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        preparer: Arc<dyn ChatPreparer>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        let idle = PipelineSnapshot {
            status: PipelineStatus::Idle,
            context: PipelineContext::default(),
            error: None,
            sequence: 0,
        };
        Self {
            transport,
            preparer,
            request_builder: Arc::new(DefaultRequestBuilder::default()),
            finalizer,
            tools: Arc::new(NoTools),
            options: PipelineOptions::default(),
            hub: Arc::new(Mutex::new(Hub {
                current: idle,
                subscribers: Vec::new(),
                next_subscriber: 0,
            })),
            active: Mutex::new(None),
        }
    }

    pub fn with_request_builder(mut self, request_builder: Arc<dyn RequestBuilder>) -> Self {
        self.request_builder = request_builder;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Subscribe to snapshots. The current snapshot is delivered first.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut hub = lock(&self.hub);
        let id = hub.next_subscriber;
        hub.next_subscriber += 1;
        let _ = sender.send(hub.current.clone());
        hub.subscribers.push((id, sender));
        Subscription {
            id,
            receiver,
            hub: Arc::downgrade(&self.hub),
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        lock(&self.hub).current.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        lock(&self.hub).current.status
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Cancel the active run. No-op when nothing is running.
    pub fn cancel(&self) {
        if let Some(run) = lock(&self.active).as_ref() {
            if !run.token.is_cancelled() {
                tracing::info!(target: "parley.pipeline.machine", "cancellation requested");
                run.token.cancel();
            }
        }
    }

    /// Route a confirmation decision to the active run. Returns whether a
    /// pending confirmation with that id existed.
    pub fn resolve_confirmation(
        &self,
        tool_call_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> bool {
        let gate = lock(&self.active).as_ref().map(|run| run.gate.clone());
        match gate {
            Some(gate) => gate.resolve(tool_call_id, approved, reason),
            None => false,
        }
    }

    fn publish(&self, status: PipelineStatus, context: PipelineContext, error: Option<SnapshotError>) {
        let mut hub = lock(&self.hub);
        let snapshot = PipelineSnapshot {
            status,
            context,
            error,
            sequence: hub.current.sequence + 1,
        };
        hub.current = snapshot.clone();
        hub.subscribers
            .retain(|(_, sender)| sender.send(snapshot.clone()).is_ok());
    }

    /// Run one submission to completion.
    ///
    /// Returns the final context on success. Cancellation returns
    /// `ParleyError::Cancelled`; other failures are returned after the
    /// `Error` snapshot has been published.
    pub async fn start(&self, params: PrepareParams) -> Result<PipelineContext> {
        let (token, gate, events) = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(ParleyError::AlreadyRunning);
            }
            let token = CancellationToken::new();
            let (gate, events) = ConfirmationGate::new(self.options.confirmation_timeout);
            *active = Some(ActiveRun {
                token: token.clone(),
                gate: gate.clone(),
            });
            (token, gate, events)
        };
        let guard = ActiveGuard {
            pipeline: self,
            token: token.clone(),
            finished: false,
        };

        let submission_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            target: "parley.pipeline.machine",
            submission_id = %submission_id,
            "submission start"
        );

        let mut run = Run {
            pipeline: self,
            builder: PipelineContextBuilder::new(submission_id.clone()),
            token,
            gate,
            events,
        };
        let result = run.execute(params).await;

        let Run { mut builder, gate, .. } = run;
        gate.clear();

        match result {
            Ok(()) => {
                tracing::info!(
                    target: "parley.pipeline.machine",
                    submission_id = %submission_id,
                    "submission completed"
                );
                let context = builder.snapshot();
                guard.finish(PipelineStatus::Completed, context.clone(), None);
                Ok(context)
            }
            Err(error) if error.is_cancelled() => {
                tracing::info!(
                    target: "parley.pipeline.machine",
                    submission_id = %submission_id,
                    "submission cancelled"
                );
                let streaming = builder.streaming_mut();
                streaming.cancelled = true;
                streaming.pending_confirmations.clear();
                streaming.running_tools.clear();
                guard.finish(
                    PipelineStatus::Cancelled,
                    builder.snapshot(),
                    Some(SnapshotError::from(&error)),
                );
                Err(error)
            }
            Err(error) => {
                tracing::warn!(
                    target: "parley.pipeline.machine",
                    submission_id = %submission_id,
                    error = %error,
                    kind = ?error.kind(),
                    "submission failed"
                );
                guard.finish(
                    PipelineStatus::Error,
                    builder.snapshot(),
                    Some(SnapshotError::from(&error)),
                );
                Err(error)
            }
        }
    }
}

/// State of one in-flight submission
struct Run<'a> {
    pipeline: &'a ChatPipeline,
    builder: PipelineContextBuilder,
    token: CancellationToken,
    gate: ConfirmationGate,
    events: mpsc::UnboundedReceiver<ConfirmationEvent>,
}

impl Run<'_> {
    fn emit(&self, status: PipelineStatus) {
        self.pipeline.publish(status, self.builder.snapshot(), None);
    }

    async fn until_cancelled<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ParleyError::Cancelled),
            result = operation => result,
        }
    }

    async fn execute(&mut self, params: PrepareParams) -> Result<()> {
        self.emit(PipelineStatus::Preparing);

        let mut prepared = self
            .until_cancelled(self.pipeline.preparer.prepare(&params))
            .await?;
        if prepared.tools.is_empty() {
            prepared.tools = self.pipeline.tools.definitions();
        }
        let ready = self.pipeline.request_builder.build_request(
            Arc::new(prepared),
            &params.prompt,
            self.token.clone(),
        )?;
        let mut ready = Arc::new(ready);
        self.builder.set_request_ready(Arc::clone(&ready));

        loop {
            self.builder.streaming_mut().begin_turn();
            self.emit(PipelineStatus::Streaming);
            self.stream_turn(&ready.request).await?;

            let streaming = self.builder.streaming_mut();
            let calls = streaming.tool_calls.clone();
            let turn = streaming.turns;
            if calls.is_empty() {
                break;
            }
            if turn >= self.pipeline.options.max_tool_rounds {
                tracing::warn!(
                    target: "parley.pipeline.machine",
                    turn,
                    max_tool_rounds = self.pipeline.options.max_tool_rounds,
                    "tool round limit reached, finalizing"
                );
                break;
            }

            tracing::info!(
                target: "parley.pipeline.machine",
                turn,
                tool_calls = calls.len(),
                "entering tool execution phase"
            );
            self.emit(PipelineStatus::ToolCall);
            let settled = self.builder.streaming_mut().tool_results.len();
            let results = self.run_tools(calls.clone()).await;
            if self.token.is_cancelled() {
                return Err(ParleyError::Cancelled);
            }

            let extra = continuation_messages(&self.builder.streaming_mut().turn_content, &calls, &results);
            let streaming = self.builder.streaming_mut();
            streaming.pending_confirmations.clear();
            streaming.running_tools.clear();
            // Replace the records folded in from progress events with the
            // full batch in call order, aborted calls included.
            streaming.tool_results.truncate(settled);
            streaming.tool_results.extend(results);
            self.emit(PipelineStatus::ToolCall);

            self.emit(PipelineStatus::Preparing);
            ready = Arc::new(ready.continuation(extra));
            self.builder.set_request_ready(Arc::clone(&ready));
        }

        self.emit(PipelineStatus::Finalizing);
        let context = self.builder.snapshot();
        self.until_cancelled(async {
            self.pipeline
                .finalizer
                .finalize(&context)
                .await
                .map_err(|e| match e {
                    ParleyError::Cancelled | ParleyError::Finalization(_) => e,
                    other => ParleyError::Finalization(other.to_string()),
                })
        })
        .await
    }

    async fn stream_turn(&mut self, request: &ChatRequest) -> Result<()> {
        let transport = Arc::clone(&self.pipeline.transport);
        let token = self.token.clone();
        let mut stream = self.until_cancelled(transport.send(request, &token)).await?;
        let mut turn_usage: Option<Usage> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ParleyError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            if let Some(usage) = chunk.usage {
                turn_usage = Some(usage);
            }

            let streaming = self.builder.streaming_mut();
            if let Some(reason) = chunk.finish_reason {
                streaming.finish_reason = Some(reason);
            }
            let (result, state) = parse_chunk(&chunk, &streaming.tool_calls, &streaming.parser_state);
            if streaming.apply(result, state) {
                self.emit(PipelineStatus::Streaming);
            }
        }

        let streaming = self.builder.streaming_mut();
        let (result, state) = flush_state(&streaming.tool_calls, &streaming.parser_state);
        let changed = streaming.apply(result, state);
        if let Some(usage) = turn_usage {
            streaming.add_usage(&usage);
        }
        if changed || turn_usage.is_some() {
            self.emit(PipelineStatus::Streaming);
        }

        tracing::debug!(
            target: "parley.pipeline.machine",
            finish_reason = ?self.builder.context().streaming.as_ref().and_then(|s| s.finish_reason),
            "stream ended"
        );
        Ok(())
    }

    async fn run_tools(&mut self, calls: Vec<ToolCall>) -> Vec<ToolResultRecord> {
        let options = &self.pipeline.options;
        let runner = ToolRunner::new(Arc::clone(&self.pipeline.tools), self.gate.clone())
            .with_max_concurrency(options.max_concurrency)
            .with_auto_approve(options.auto_approve);
        let (progress_tx, mut progress) = mpsc::unbounded_channel();
        let runner = runner.with_progress(progress_tx);
        let token = self.token.clone();

        let run = runner.run(calls, &token);
        tokio::pin!(run);

        loop {
            tokio::select! {
                results = &mut run => {
                    // Calls that finished within the last poll still get
                    // their own snapshot.
                    while let Ok(update) = progress.try_recv() {
                        self.fold_progress(update);
                        self.emit(PipelineStatus::ToolCall);
                    }
                    return results;
                }
                Some(_event) = self.events.recv() => {
                    let pending = self.gate.pending();
                    self.builder.streaming_mut().pending_confirmations = pending;
                    self.emit(PipelineStatus::ToolCall);
                }
                Some(update) = progress.recv() => {
                    self.fold_progress(update);
                    self.emit(PipelineStatus::ToolCall);
                }
            }
        }
    }

    fn fold_progress(&mut self, update: ToolProgress) {
        let streaming = self.builder.streaming_mut();
        match update {
            ToolProgress::Started { tool_call_id, .. } => {
                streaming.running_tools.push(tool_call_id);
            }
            ToolProgress::Completed(record) | ToolProgress::Failed(record) => {
                streaming
                    .running_tools
                    .retain(|id| *id != record.tool_call_id);
                streaming
                    .pending_confirmations
                    .retain(|p| p.tool_call_id != record.tool_call_id);
                streaming.tool_results.push(record);
            }
        }
    }
}

/// Assistant turn with its tool calls, followed by one result per call
fn continuation_messages(
    content: &str,
    calls: &[ToolCall],
    results: &[ToolResultRecord],
) -> Vec<ChatMessage> {
    let wire_calls = calls
        .iter()
        .map(|call| MessageToolCall {
            id: call.id.clone(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments.clone()
                },
            },
        })
        .collect();

    let mut messages = vec![ChatMessage::assistant_with_tools(content, wire_calls)];
    messages.extend(results.iter().map(ToolResultRecord::to_message));
    messages
}
