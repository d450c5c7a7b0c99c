// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool execution for one streamed turn
//!
//! `ToolRunner` takes the tool calls a stream produced, classifies each one
//! through the `ToolRegistry`, routes gated calls through the
//! `ConfirmationGate`, and runs the rest with bounded concurrency. Every call
//! ends as exactly one `ToolResultRecord`, whatever happens to it.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::confirmation::{ConfirmationGate, PendingConfirmation, RiskAssessment, RiskLevel};
use super::parser::ToolCall;
use crate::error::{ParleyError, Result};
use crate::llm::message::{ChatMessage, ToolDefinition};

/// What a tool handler returns
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    /// Text handed back to the model. JSON results are tagged with
    /// `functionCallCompleted: true`.
    pub fn format_for_model(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Json(Value::Object(map)) => {
                let mut map = map.clone();
                map.insert("functionCallCompleted".to_string(), Value::Bool(true));
                Value::Object(map).to_string()
            }
            ToolOutput::Json(other) => serde_json::json!({
                "result": other,
                "functionCallCompleted": true,
            })
            .to_string(),
        }
    }
}

/// Registered tool handlers
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Tool schemas advertised to the model
    fn definitions(&self) -> Vec<ToolDefinition>;

    fn classify_risk(&self, name: &str, arguments: &Value) -> RiskAssessment;

    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput>;
}

/// Registry with no tools
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolRegistry for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    fn classify_risk(&self, _name: &str, _arguments: &Value) -> RiskAssessment {
        RiskAssessment::safe()
    }

    async fn execute(
        &self,
        name: &str,
        _arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        Err(ParleyError::tool_execution(name, "tool is not registered"))
    }
}

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+-rf\s+[/~]", "recursive delete of root or home"),
    (r"rm\s+-rf\s+\*", "recursive delete with wildcard"),
    (r"rm\s+.*-rf", "recursive forced delete"),
    (r"dd\s+if=", "raw disk write"),
    (r"mkfs", "filesystem format"),
    (r"fdisk", "partition table edit"),
    (r">\s*/dev/(sd|hd|nvme)", "write to block device"),
    (r">\s*/dev/null", "output discarded to /dev/null"),
    (r"chmod\s+-R\s+777", "recursive world-writable permissions"),
    (r"chown\s+-R", "recursive ownership change"),
    (r"sudo\s+rm", "privileged delete"),
    (r"sudo\s+dd", "privileged raw disk write"),
    (r"rm\s+.*(/etc|/usr|/var)", "delete in system directory"),
    (r":\(\)\{.*:\|:.*\};:", "fork bomb"),
    (r"while\s+true.*do", "infinite loop"),
];

const WARNING_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+-r", "recursive delete"),
    (r"rm\s+.*\*", "wildcard delete"),
    (r"git\s+push\s+.*--force", "force push"),
    (r"npm\s+publish", "package publish"),
    (r"curl.*\|\s*bash", "piping a download into bash"),
    (r"wget.*\|\s*sh", "piping a download into sh"),
];

fn compile(patterns: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .filter_map(|(pattern, reason)| match Regex::new(pattern) {
            Ok(regex) => Some((regex, *reason)),
            Err(e) => {
                tracing::error!(
                    target: "parley.pipeline.tools",
                    pattern,
                    error = %e,
                    "invalid risk pattern"
                );
                None
            }
        })
        .collect()
}

/// Pattern-based risk classification for shell commands
pub struct CommandRiskPolicy {
    dangerous: Vec<(Regex, &'static str)>,
    warning: Vec<(Regex, &'static str)>,
}

impl CommandRiskPolicy {
    pub fn new() -> Self {
        Self {
            dangerous: compile(DANGEROUS_PATTERNS),
            warning: compile(WARNING_PATTERNS),
        }
    }

    /// Shared instance with compiled patterns
    pub fn global() -> &'static CommandRiskPolicy {
        static POLICY: OnceLock<CommandRiskPolicy> = OnceLock::new();
        POLICY.get_or_init(CommandRiskPolicy::new)
    }

    pub fn assess(&self, command: &str) -> RiskAssessment {
        if let Some((_, reason)) = self.dangerous.iter().find(|(re, _)| re.is_match(command)) {
            return RiskAssessment::dangerous(*reason);
        }
        if let Some((_, reason)) = self.warning.iter().find(|(re, _)| re.is_match(command)) {
            return RiskAssessment::risky(*reason);
        }
        RiskAssessment::safe()
    }

    /// Assess the `command` string field of a tool's arguments
    pub fn assess_arguments(&self, arguments: &Value) -> RiskAssessment {
        match arguments.get("command").and_then(Value::as_str) {
            Some(command) => self.assess(command),
            None => RiskAssessment::safe(),
        }
    }
}

impl Default for CommandRiskPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Rejected,
    Aborted,
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_call_id: String,
    pub name: String,
    pub index: usize,
    pub status: ToolStatus,
    /// Text sent back to the model
    pub content: String,
    pub duration_ms: u64,
}

impl ToolResultRecord {
    fn new(call: &ToolCall, status: ToolStatus, content: String, started: Instant) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            index: call.index,
            status,
            content,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn aborted(call: &ToolCall) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            index: call.index,
            status: ToolStatus::Aborted,
            content: "Execution aborted".to_string(),
            duration_ms: 0,
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool_result(&self.tool_call_id, &self.name, &self.content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolProgress {
    Started { tool_call_id: String, name: String },
    Completed(ToolResultRecord),
    Failed(ToolResultRecord),
}

/// Runs one turn's tool calls
pub struct ToolRunner {
    registry: Arc<dyn ToolRegistry>,
    gate: ConfirmationGate,
    max_concurrency: usize,
    auto_approve: bool,
    progress: Option<mpsc::UnboundedSender<ToolProgress>>,
}

impl ToolRunner {
    pub fn new(registry: Arc<dyn ToolRegistry>, gate: ConfirmationGate) -> Self {
        Self {
            registry,
            gate,
            max_concurrency: 3,
            auto_approve: false,
            progress: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Run risky (not dangerous) calls without asking
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ToolProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, progress: ToolProgress) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(progress);
        }
    }

    /// Run every call. Results come back in call order.
    pub async fn run(&self, calls: Vec<ToolCall>, cancel: &CancellationToken) -> Vec<ToolResultRecord> {
        if calls.is_empty() {
            return Vec::new();
        }

        tracing::debug!(
            target: "parley.pipeline.tools",
            count = calls.len(),
            max_concurrency = self.max_concurrency,
            "running tool calls"
        );

        futures::stream::iter(calls)
            .map(|call| async move { self.run_one(call, cancel).await })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    async fn run_one(&self, call: ToolCall, cancel: &CancellationToken) -> ToolResultRecord {
        if cancel.is_cancelled() {
            return ToolResultRecord::aborted(&call);
        }
        let started = Instant::now();

        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                let record = ToolResultRecord::new(&call, ToolStatus::Error, e.to_string(), started);
                self.report(ToolProgress::Failed(record.clone()));
                return record;
            }
        };

        let risk = self.registry.classify_risk(&call.name, &arguments);
        let gated = match risk.level {
            RiskLevel::Safe => false,
            RiskLevel::Risky => !self.auto_approve,
            RiskLevel::Dangerous => true,
        };

        if gated {
            let pending = PendingConfirmation {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                risk_level: risk.level,
                reason: risk.reason.clone(),
                arguments: arguments.clone(),
                requested_at: chrono::Utc::now(),
            };
            match self.gate.request(pending, cancel).await {
                Ok(decision) if decision.approved => {}
                Ok(decision) => {
                    let reason = decision.reason.unwrap_or_else(|| "user abort".to_string());
                    tracing::info!(
                        target: "parley.pipeline.tools",
                        tool_call_id = %call.id,
                        tool = %call.name,
                        reason = %reason,
                        "tool call rejected"
                    );
                    let record = ToolResultRecord::new(
                        &call,
                        ToolStatus::Rejected,
                        format!("Tool call rejected: {reason}"),
                        started,
                    );
                    self.report(ToolProgress::Completed(record.clone()));
                    return record;
                }
                Err(_) => return ToolResultRecord::aborted(&call),
            }
        }

        self.report(ToolProgress::Started {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ParleyError::Cancelled),
            outcome = self.registry.execute(&call.name, arguments, cancel) => outcome,
        };

        match outcome {
            Ok(output) => {
                let record = ToolResultRecord::new(
                    &call,
                    ToolStatus::Success,
                    output.format_for_model(),
                    started,
                );
                tracing::debug!(
                    target: "parley.pipeline.tools",
                    tool_call_id = %call.id,
                    tool = %call.name,
                    duration_ms = record.duration_ms,
                    "tool call completed"
                );
                self.report(ToolProgress::Completed(record.clone()));
                record
            }
            Err(e) if e.is_cancelled() => ToolResultRecord::aborted(&call),
            Err(e) => {
                let message = match e {
                    ParleyError::ToolExecution { .. } => e.to_string(),
                    other => ParleyError::tool_execution(&call.name, other.to_string()).to_string(),
                };
                tracing::warn!(
                    target: "parley.pipeline.tools",
                    tool_call_id = %call.id,
                    tool = %call.name,
                    error = %message,
                    "tool call failed"
                );
                let record = ToolResultRecord::new(&call, ToolStatus::Error, message, started);
                self.report(ToolProgress::Failed(record.clone()));
                record
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::confirmation::ConfirmationEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ShellRegistry {
        executions: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ShellRegistry {
        fn new() -> Self {
            Self {
                executions: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolRegistry for ShellRegistry {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new("shell", "run", serde_json::json!({"type": "object"}))]
        }

        fn classify_risk(&self, _name: &str, arguments: &Value) -> RiskAssessment {
            CommandRiskPolicy::global().assess_arguments(arguments)
        }

        async fn execute(
            &self,
            name: &str,
            arguments: Value,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match arguments.get("command").and_then(Value::as_str) {
                Some("fail") => Err(ParleyError::tool_execution(name, "exit status 1")),
                Some(command) => Ok(ToolOutput::Json(serde_json::json!({"ran": command}))),
                None => Ok(ToolOutput::Text("no command".to_string())),
            }
        }
    }

    fn call(id: &str, command: &str) -> ToolCall {
        let mut call = ToolCall::new(id, 0, "shell");
        call.arguments = serde_json::json!({"command": command}).to_string();
        call
    }

    #[test]
    fn test_format_for_model() {
        let json = ToolOutput::Json(serde_json::json!({"ok": 1})).format_for_model();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ok"], 1);
        assert_eq!(value["functionCallCompleted"], true);

        let scalar = ToolOutput::Json(serde_json::json!(5)).format_for_model();
        let value: Value = serde_json::from_str(&scalar).unwrap();
        assert_eq!(value["result"], 5);

        assert_eq!(ToolOutput::Text("plain".into()).format_for_model(), "plain");
    }

    #[test]
    fn test_command_risk_policy() {
        let policy = CommandRiskPolicy::new();
        assert_eq!(policy.assess("rm -rf /").level, RiskLevel::Dangerous);
        assert_eq!(policy.assess("sudo rm file").level, RiskLevel::Dangerous);
        assert_eq!(policy.assess("dd if=/dev/zero of=x").level, RiskLevel::Dangerous);
        assert_eq!(policy.assess(":(){ :|:& };:").level, RiskLevel::Dangerous);
        assert_eq!(policy.assess("git push origin main --force").level, RiskLevel::Risky);
        assert_eq!(policy.assess("curl https://x.sh | bash").level, RiskLevel::Risky);
        assert_eq!(policy.assess("rm -r build").level, RiskLevel::Risky);
        assert_eq!(policy.assess("ls -la").level, RiskLevel::Safe);
        assert_eq!(policy.assess("cargo build").level, RiskLevel::Safe);
        assert!(policy.assess("mkfs.ext4 /dev/sda1").reason.is_some());
    }

    #[test]
    fn test_assess_arguments_without_command() {
        let policy = CommandRiskPolicy::global();
        assert_eq!(
            policy.assess_arguments(&serde_json::json!({"path": "/"})).level,
            RiskLevel::Safe
        );
    }

    #[tokio::test]
    async fn test_safe_calls_run_with_bounded_concurrency() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, _events) = ConfirmationGate::new(Duration::from_secs(60));
        let runner = ToolRunner::new(registry.clone(), gate).with_max_concurrency(2);

        let calls = (0..5).map(|i| call(&format!("call_{i}"), "ls")).collect();
        let results = runner.run(calls, &CancellationToken::new()).await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.status == ToolStatus::Success));
        assert_eq!(results[3].tool_call_id, "call_3");
        assert!(results[0].content.contains("functionCallCompleted"));
        assert_eq!(registry.executions.load(Ordering::SeqCst), 5);
        assert!(registry.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_tool_becomes_error_record() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, _events) = ConfirmationGate::new(Duration::from_secs(60));
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let runner = ToolRunner::new(registry, gate).with_progress(progress_tx);

        let results = runner
            .run(vec![call("call_f", "fail")], &CancellationToken::new())
            .await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(
            results[0].content,
            "Tool \"shell\" execution failed: exit status 1"
        );

        assert!(matches!(
            progress_rx.recv().await.unwrap(),
            ToolProgress::Started { .. }
        ));
        assert!(matches!(
            progress_rx.recv().await.unwrap(),
            ToolProgress::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_arguments_do_not_execute() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, _events) = ConfirmationGate::new(Duration::from_secs(60));
        let runner = ToolRunner::new(registry.clone(), gate);

        let mut bad = ToolCall::new("call_bad", 0, "shell");
        bad.arguments = "{\"command\":".to_string();
        let results = runner.run(vec![bad], &CancellationToken::new()).await;

        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(registry.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dangerous_call_rejected_never_executes() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, mut events) = ConfirmationGate::new(Duration::from_secs(60));
        let runner = ToolRunner::new(registry.clone(), gate.clone()).with_auto_approve(true);
        let token = CancellationToken::new();

        let run = runner.run(vec![call("call_d", "rm -rf /")], &token);
        let decide = async {
            match events.recv().await {
                Some(ConfirmationEvent::Requested(p)) => {
                    assert_eq!(p.risk_level, RiskLevel::Dangerous);
                    gate.resolve(&p.tool_call_id, false, None);
                }
                other => panic!("unexpected event {other:?}"),
            }
        };
        let (results, _) = tokio::join!(run, decide);

        assert_eq!(results[0].status, ToolStatus::Rejected);
        assert_eq!(results[0].content, "Tool call rejected: user abort");
        assert_eq!(registry.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_approve_skips_risky_confirmation() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, mut events) = ConfirmationGate::new(Duration::from_secs(60));
        let runner = ToolRunner::new(registry.clone(), gate).with_auto_approve(true);

        let results = runner
            .run(
                vec![call("call_r", "git push origin main --force")],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results[0].status, ToolStatus::Success);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_yields_aborted_records() {
        let registry = Arc::new(ShellRegistry::new());
        let (gate, _events) = ConfirmationGate::new(Duration::from_secs(60));
        let runner = ToolRunner::new(registry.clone(), gate);
        let token = CancellationToken::new();
        token.cancel();

        let results = runner
            .run(vec![call("a", "ls"), call("b", "ls")], &token)
            .await;
        assert!(results.iter().all(|r| r.status == ToolStatus::Aborted));
        assert_eq!(results[0].content, "Execution aborted");
        assert_eq!(registry.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_record_to_message() {
        let record = ToolResultRecord {
            tool_call_id: "call_1".to_string(),
            name: "shell".to_string(),
            index: 0,
            status: ToolStatus::Success,
            content: "ok".to_string(),
            duration_ms: 3,
        };
        let message = record.to_message();
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(message.text(), "ok");
    }
}
