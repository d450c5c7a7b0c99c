// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool-call confirmation gate
//!
//! Risky tool calls wait here for a user decision. Each pending call is keyed
//! by its `tool_call_id` and resolved exactly once, either by `resolve`, by
//! the confirmation timeout, or by the run being cancelled. Observers learn
//! about requests and decisions through the gate's event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{ParleyError, Result};

/// How dangerous a tool call is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Risky,
    Dangerous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: Option<String>,
}

impl RiskAssessment {
    pub fn safe() -> Self {
        Self {
            level: RiskLevel::Safe,
            reason: None,
        }
    }

    pub fn risky(reason: impl Into<String>) -> Self {
        Self {
            level: RiskLevel::Risky,
            reason: Some(reason.into()),
        }
    }

    pub fn dangerous(reason: impl Into<String>) -> Self {
        Self {
            level: RiskLevel::Dangerous,
            reason: Some(reason.into()),
        }
    }

    pub fn needs_confirmation(&self) -> bool {
        self.level != RiskLevel::Safe
    }
}

/// A tool call awaiting a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub tool_call_id: String,
    pub name: String,
    pub risk_level: RiskLevel,
    pub reason: Option<String>,
    pub arguments: Value,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ConfirmationDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn reject(reason: Option<String>) -> Self {
        Self {
            approved: false,
            reason,
        }
    }

    pub fn timed_out() -> Self {
        Self::reject(Some("timeout".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationEvent {
    Requested(PendingConfirmation),
    Resolved {
        tool_call_id: String,
        decision: ConfirmationDecision,
    },
}

struct PendingEntry {
    confirmation: PendingConfirmation,
    waiters: Vec<oneshot::Sender<ConfirmationDecision>>,
}

struct GateInner {
    pending: Mutex<HashMap<String, PendingEntry>>,
    events: mpsc::UnboundedSender<ConfirmationEvent>,
    timeout: Duration,
}

/// Per-submission confirmation gate. Cloning shares the same pending map.
#[derive(Clone)]
pub struct ConfirmationGate {
    inner: Arc<GateInner>,
}

impl ConfirmationGate {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ConfirmationEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let gate = Self {
            inner: Arc::new(GateInner {
                pending: Mutex::new(HashMap::new()),
                events,
                timeout,
            }),
        };
        (gate, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(
                    target: "parley.pipeline.confirmation",
                    "pending map lock was poisoned, recovering"
                );
                poisoned.into_inner()
            }
        }
    }

    fn emit(&self, event: ConfirmationEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    /// Wait for a decision on `confirmation`.
    ///
    /// A second request for an id that is already pending joins the first
    /// one's decision without publishing another event. Unanswered requests
    /// are rejected with reason `timeout`.
    pub async fn request(
        &self,
        confirmation: PendingConfirmation,
        cancel: &CancellationToken,
    ) -> Result<ConfirmationDecision> {
        let tool_call_id = confirmation.tool_call_id.clone();
        let (sender, receiver) = oneshot::channel();

        let is_new = {
            let mut pending = self.lock();
            match pending.get_mut(&tool_call_id) {
                Some(entry) => {
                    entry.waiters.push(sender);
                    false
                }
                None => {
                    pending.insert(
                        tool_call_id.clone(),
                        PendingEntry {
                            confirmation: confirmation.clone(),
                            waiters: vec![sender],
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            tracing::info!(
                target: "parley.pipeline.confirmation",
                tool_call_id = %tool_call_id,
                tool = %confirmation.name,
                risk = ?confirmation.risk_level,
                "awaiting confirmation"
            );
            self.emit(ConfirmationEvent::Requested(confirmation));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.lock().remove(&tool_call_id);
                Err(ParleyError::Cancelled)
            }
            decision = receiver => match decision {
                Ok(decision) => Ok(decision),
                // Sender dropped without a decision: the gate was cleared.
                Err(_) => Err(ParleyError::Cancelled),
            },
            _ = tokio::time::sleep(self.inner.timeout) => {
                tracing::warn!(
                    target: "parley.pipeline.confirmation",
                    tool_call_id = %tool_call_id,
                    "confirmation timed out"
                );
                self.resolve_decision(&tool_call_id, ConfirmationDecision::timed_out());
                Ok(ConfirmationDecision::timed_out())
            }
        }
    }

    /// Deliver a decision. Returns `false` if the id is not pending, which
    /// includes ids that were already resolved.
    pub fn resolve(&self, tool_call_id: &str, approved: bool, reason: Option<String>) -> bool {
        let decision = if approved {
            ConfirmationDecision {
                approved: true,
                reason,
            }
        } else {
            ConfirmationDecision::reject(reason)
        };
        self.resolve_decision(tool_call_id, decision)
    }

    fn resolve_decision(&self, tool_call_id: &str, decision: ConfirmationDecision) -> bool {
        let Some(entry) = self.lock().remove(tool_call_id) else {
            return false;
        };

        tracing::info!(
            target: "parley.pipeline.confirmation",
            tool_call_id = %tool_call_id,
            approved = decision.approved,
            "confirmation resolved"
        );
        for waiter in entry.waiters {
            let _ = waiter.send(decision.clone());
        }
        self.emit(ConfirmationEvent::Resolved {
            tool_call_id: tool_call_id.to_string(),
            decision,
        });
        true
    }

    pub fn pending(&self) -> Vec<PendingConfirmation> {
        let mut pending: Vec<PendingConfirmation> = self
            .lock()
            .values()
            .map(|entry| entry.confirmation.clone())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    pub fn is_pending(&self, tool_call_id: &str) -> bool {
        self.lock().contains_key(tool_call_id)
    }

    /// Drop every pending request; waiters observe cancellation.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
