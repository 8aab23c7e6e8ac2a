//! Decision records for requests that block an agent turn.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

/// A tool call waiting for the user's approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub tool_input: Value,
    /// Rule updates the agent proposes (e.g. "always allow in this dir").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum PermissionDecision {
    Allow,
    Deny {
        #[serde(default)]
        message: Option<String>,
    },
    AllowWithModifications {
        #[serde(default)]
        updated_input: Option<Value>,
        #[serde(default)]
        updated_permissions: Vec<Value>,
    },
    /// The session went away before anyone decided.
    Cancelled,
}

/// One or more multiple-choice prompts shown together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub questions: Vec<QuestionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    pub question: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "answers", rename_all = "kebab-case")]
pub enum QuestionDecision {
    /// Selected labels, one list per sub-question in request order.
    Answered(Vec<Vec<String>>),
    Cancelled,
}

impl QuestionRequest {
    /// Check that `answers` fits this request: one entry per sub-question,
    /// exactly one label for single-select, every label a known option.
    pub fn validate(&self, answers: &[Vec<String>]) -> Result<()> {
        if answers.len() != self.questions.len() {
            return Err(BridgeError::InvalidAnswer(format!(
                "expected {} answers, got {}",
                self.questions.len(),
                answers.len()
            )));
        }
        for (item, selected) in self.questions.iter().zip(answers) {
            if selected.is_empty() || (!item.multi_select && selected.len() > 1) {
                return Err(BridgeError::InvalidAnswer(format!(
                    "'{}' takes {} selection",
                    item.question,
                    if item.multi_select { "at least one" } else { "exactly one" }
                )));
            }
            if let Some(unknown) = selected
                .iter()
                .find(|label| !item.options.iter().any(|o| &o.label == *label))
            {
                return Err(BridgeError::InvalidAnswer(format!(
                    "'{unknown}' is not an option of '{}'",
                    item.question
                )));
            }
        }
        Ok(())
    }
}

/// Decisions that have a "nobody answered" value.
pub trait Cancellable {
    fn cancelled() -> Self;
    fn is_cancelled(&self) -> bool;
}

impl Cancellable for PermissionDecision {
    fn cancelled() -> Self {
        PermissionDecision::Cancelled
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, PermissionDecision::Cancelled)
    }
}

impl Cancellable for QuestionDecision {
    fn cancelled() -> Self {
        QuestionDecision::Cancelled
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, QuestionDecision::Cancelled)
    }
}

/// The suspended side of a pending request.
///
/// Resolves exactly once, with the user's decision or with the cancellation
/// value if the owning session is torn down or dropped.
#[derive(Debug)]
pub struct Pending<D> {
    token: String,
    rx: oneshot::Receiver<D>,
}

impl<D: Cancellable> Pending<D> {
    pub(crate) fn new(token: String, rx: oneshot::Receiver<D>) -> Self {
        Self { token, rx }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Block the current thread until resolved. Must not be called from
    /// inside an async runtime.
    pub fn wait_blocking(self) -> D {
        self.rx.blocking_recv().unwrap_or_else(|_| D::cancelled())
    }
}

impl<D: Cancellable> Future for Pending<D> {
    type Output = D;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<D> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| D::cancelled()))
    }
}
