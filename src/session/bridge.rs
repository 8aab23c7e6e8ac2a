//! One agent session's lifecycle, history and outstanding decisions.
//!
//! ```text
//! starting -> running <-> awaiting-input -> completed
//!        \________\____________\__________-> error
//! ```
//!
//! Registering a permission or question parks a continuation under its
//! token and moves the session to `awaiting-input`; resolving the last one
//! moves it back to `running`. Every continuation resolves exactly once:
//! with the user's decision, or with a cancellation on teardown, failure,
//! or drop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::history::{HistoryRecord, HistoryReport, HistoryWriter, RestoredHistory};
use super::message::Turn;
use super::pending::{
    Cancellable, Pending, PermissionDecision, PermissionRequest, QuestionDecision,
    QuestionRequest,
};
use super::state::{SessionStatus, Usage};
use crate::error::{BridgeError, Result};
use crate::protocol::types::TokenUsage;

/// Launch parameters for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    /// Agent-side session to continue.
    pub resume_session_id: Option<String>,
    /// Where to append this session's history, if anywhere.
    pub history_path: Option<PathBuf>,
}

struct PendingEntry<R, D> {
    request: R,
    continuation: oneshot::Sender<D>,
}

impl<R, D: Cancellable> PendingEntry<R, D> {
    fn deliver(self, decision: D) -> bool {
        self.continuation.send(decision).is_ok()
    }
}

pub struct SessionBridge {
    session_id: String,
    cli_session_id: Option<String>,
    resume_session_id: Option<String>,
    cwd: PathBuf,
    model: String,
    status: SessionStatus,
    messages: Vec<Turn>,
    /// Assistant message id -> slot in `messages`.
    turn_slots: HashMap<String, usize>,
    tool_uses: HashSet<String>,
    pending_permissions: HashMap<String, PendingEntry<PermissionRequest, PermissionDecision>>,
    pending_questions: HashMap<String, PendingEntry<QuestionRequest, QuestionDecision>>,
    usage: Usage,
    next_token: u64,
    history: Option<HistoryWriter>,
}

impl SessionBridge {
    /// Start a session in `starting`.
    ///
    /// `is_known_session` decides whether a `resume_session_id` refers to a
    /// prior session.
    pub fn create(
        session_id: impl Into<String>,
        config: SessionConfig,
        is_known_session: impl Fn(&str) -> bool,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let cwd = config
            .cwd
            .ok_or_else(|| BridgeError::Configuration("working directory is required".into()))?;
        let model = config
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| BridgeError::Configuration("model is required".into()))?;
        if let Some(resume) = &config.resume_session_id {
            if !is_known_session(resume) {
                return Err(BridgeError::Configuration(format!(
                    "unknown session to resume: {resume}"
                )));
            }
        }

        let mut history = config
            .history_path
            .as_deref()
            .map(HistoryWriter::open)
            .transpose()?;
        if let Some(writer) = history.as_mut() {
            writer.append(&HistoryRecord::Session {
                session_id: session_id.clone(),
                cli_session_id: config.resume_session_id.clone(),
                model: Some(model.clone()),
                cwd: Some(cwd.clone()),
            })?;
        }

        info!(session_id = %session_id, model = %model, "session created");
        Ok(Self {
            session_id,
            cli_session_id: config.resume_session_id.clone(),
            resume_session_id: config.resume_session_id,
            cwd,
            model,
            status: SessionStatus::Starting,
            messages: Vec::new(),
            turn_slots: HashMap::new(),
            tool_uses: HashSet::new(),
            pending_permissions: HashMap::new(),
            pending_questions: HashMap::new(),
            usage: Usage::default(),
            next_token: 0,
            history,
        })
    }

    /// Rebuild message history from persisted records. Records were already
    /// filtered by the loader; anything still inconsistent is skipped and
    /// counted rather than failing the restore.
    pub fn restore(&mut self, restored: RestoredHistory) -> HistoryReport {
        let mut report = restored.report;
        for record in restored.records {
            match record {
                HistoryRecord::Session { cli_session_id, .. } => {
                    if cli_session_id.is_some() {
                        self.cli_session_id = cli_session_id;
                    }
                }
                HistoryRecord::Message { turn } => {
                    if let Some(orphan) = self.find_orphan(&turn) {
                        debug!(session_id = %self.session_id, tool_use_id = orphan, "orphan skipped on restore");
                        report.orphan_tool_results += 1;
                        report.records -= 1;
                        continue;
                    }
                    if let Some(writer) = self.history.as_mut() {
                        writer.remember_tool_uses(turn.tool_use_ids());
                    }
                    self.apply_turn(turn);
                }
                HistoryRecord::Status { .. } => {}
            }
        }
        info!(
            session_id = %self.session_id,
            messages = self.messages.len(),
            skipped = report.skipped,
            orphans = report.orphan_tool_results,
            "session history restored"
        );
        report
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cli_session_id(&self) -> Option<&str> {
        self.cli_session_id.as_deref()
    }

    pub fn resume_session_id(&self) -> Option<&str> {
        self.resume_session_id.as_deref()
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn history_path(&self) -> Option<&std::path::Path> {
        self.history.as_ref().map(HistoryWriter::path)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn messages(&self) -> &[Turn] {
        &self.messages
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn pending_permission_count(&self) -> usize {
        self.pending_permissions.len()
    }

    pub fn pending_question_count(&self) -> usize {
        self.pending_questions.len()
    }

    pub fn pending_permissions(&self) -> impl Iterator<Item = (&str, &PermissionRequest)> {
        self.pending_permissions
            .iter()
            .map(|(token, entry)| (token.as_str(), &entry.request))
    }

    pub fn pending_questions(&self) -> impl Iterator<Item = (&str, &QuestionRequest)> {
        self.pending_questions
            .iter()
            .map(|(token, entry)| (token.as_str(), &entry.request))
    }

    /// A fresh token, distinct from every other token this session issues.
    pub fn next_token(&mut self) -> String {
        self.next_token += 1;
        format!("{}-req-{}", self.session_id, self.next_token)
    }

    /// The agent reported it is up. Records its own session id, which later
    /// sessions may resume.
    pub fn mark_running(&mut self, cli_session_id: Option<&str>) {
        if let Some(id) = cli_session_id.filter(|id| !id.is_empty()) {
            if self.cli_session_id.as_deref() != Some(id) {
                self.cli_session_id = Some(id.to_string());
                self.persist(&HistoryRecord::Session {
                    session_id: self.session_id.clone(),
                    cli_session_id: self.cli_session_id.clone(),
                    model: Some(self.model.clone()),
                    cwd: Some(self.cwd.clone()),
                });
            }
        }
        if self.status == SessionStatus::Starting {
            self.status = SessionStatus::Running;
            info!(session_id = %self.session_id, "session running");
        }
    }

    /// Append a turn to the history, merging partial turns that share an
    /// id into one slot. Returns the slot index.
    pub fn append_message(&mut self, turn: Turn) -> Result<usize> {
        if self.status.is_terminal() {
            return Err(BridgeError::SessionClosed);
        }
        if let Some(orphan) = self.find_orphan(&turn) {
            return Err(BridgeError::OrphanToolResult(orphan.to_string()));
        }
        if let Some(writer) = self.history.as_mut() {
            writer.append(&HistoryRecord::Message { turn: turn.clone() })?;
        }
        Ok(self.apply_turn(turn))
    }

    fn find_orphan<'a>(&self, turn: &'a Turn) -> Option<&'a str> {
        let own: HashSet<&str> = turn.tool_use_ids().collect();
        turn.tool_result_ids()
            .find(|id| !own.contains(id) && !self.tool_uses.contains(*id))
    }

    fn apply_turn(&mut self, turn: Turn) -> usize {
        self.tool_uses
            .extend(turn.tool_use_ids().map(str::to_string));
        if let Some(&slot) = turn.id.as_ref().and_then(|id| self.turn_slots.get(id)) {
            self.messages[slot].blocks.extend(turn.blocks);
            return slot;
        }
        let slot = self.messages.len();
        if let Some(id) = &turn.id {
            self.turn_slots.insert(id.clone(), slot);
        }
        self.messages.push(turn);
        slot
    }

    /// Fold one completed agent turn's usage into the running totals.
    pub fn record_usage(&mut self, tokens: Option<&TokenUsage>, total_cost_usd: f64, num_turns: u32) {
        if let Some(tokens) = tokens {
            self.usage.add_tokens(tokens);
        }
        self.usage.observe_totals(total_cost_usd, num_turns);
    }

    fn check_token_free(&self, token: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BridgeError::SessionClosed);
        }
        if self.pending_permissions.contains_key(token) || self.pending_questions.contains_key(token) {
            return Err(BridgeError::DuplicateToken(token.to_string()));
        }
        Ok(())
    }

    /// Park a tool permission request. The returned future resolves once
    /// [`resolve_permission`](Self::resolve_permission) is called for
    /// `token` or the session ends.
    pub fn register_permission_request(
        &mut self,
        token: impl Into<String>,
        request: PermissionRequest,
    ) -> Result<Pending<PermissionDecision>> {
        let token = token.into();
        self.check_token_free(&token)?;
        let (tx, rx) = oneshot::channel();
        info!(
            session_id = %self.session_id,
            token = %token,
            tool = %request.tool_name,
            "permission requested"
        );
        self.pending_permissions.insert(
            token.clone(),
            PendingEntry {
                request,
                continuation: tx,
            },
        );
        self.status = SessionStatus::AwaitingInput;
        Ok(Pending::new(token, rx))
    }

    pub fn resolve_permission(&mut self, token: &str, decision: PermissionDecision) -> Result<()> {
        let entry = self
            .pending_permissions
            .remove(token)
            .ok_or_else(|| BridgeError::UnknownToken(token.to_string()))?;
        info!(session_id = %self.session_id, token = %token, decision = ?decision, "permission resolved");
        if !entry.deliver(decision) {
            debug!(token = %token, "permission waiter already gone");
        }
        self.after_resolution();
        Ok(())
    }

    /// Park a multiple-choice question. See
    /// [`register_permission_request`](Self::register_permission_request).
    pub fn register_question_request(
        &mut self,
        token: impl Into<String>,
        request: QuestionRequest,
    ) -> Result<Pending<QuestionDecision>> {
        let token = token.into();
        self.check_token_free(&token)?;
        let (tx, rx) = oneshot::channel();
        info!(
            session_id = %self.session_id,
            token = %token,
            questions = request.questions.len(),
            "question requested"
        );
        self.pending_questions.insert(
            token.clone(),
            PendingEntry {
                request,
                continuation: tx,
            },
        );
        self.status = SessionStatus::AwaitingInput;
        Ok(Pending::new(token, rx))
    }

    /// Answers that do not fit the question are rejected and the question
    /// stays pending.
    pub fn resolve_question(&mut self, token: &str, decision: QuestionDecision) -> Result<()> {
        let entry = self
            .pending_questions
            .get(token)
            .ok_or_else(|| BridgeError::UnknownToken(token.to_string()))?;
        if let QuestionDecision::Answered(answers) = &decision {
            entry.request.validate(answers)?;
        }
        let Some(entry) = self.pending_questions.remove(token) else {
            return Err(BridgeError::UnknownToken(token.to_string()));
        };
        info!(session_id = %self.session_id, token = %token, "question resolved");
        if !entry.deliver(decision) {
            debug!(token = %token, "question waiter already gone");
        }
        self.after_resolution();
        Ok(())
    }

    fn after_resolution(&mut self) {
        if self.status == SessionStatus::AwaitingInput
            && self.pending_permissions.is_empty()
            && self.pending_questions.is_empty()
        {
            self.status = SessionStatus::Running;
        }
    }

    fn cancel_pending(&mut self) -> usize {
        let mut cancelled = 0;
        for (token, entry) in self.pending_permissions.drain() {
            debug!(token = %token, "permission cancelled");
            entry.deliver(PermissionDecision::cancelled());
            cancelled += 1;
        }
        for (token, entry) in self.pending_questions.drain() {
            debug!(token = %token, "question cancelled");
            entry.deliver(QuestionDecision::cancelled());
            cancelled += 1;
        }
        cancelled
    }

    /// Best-effort append for bookkeeping records.
    fn persist(&mut self, record: &HistoryRecord) {
        if let Some(writer) = self.history.as_mut() {
            if let Err(e) = writer.append(record) {
                warn!(error = %e, path = %writer.path().display(), "failed to persist history record");
            }
        }
    }

    fn persist_status(&mut self) {
        let status = self.status;
        self.persist(&HistoryRecord::Status { status });
    }

    /// The agent died or the session otherwise broke. Cancels everything
    /// pending and moves to `error`. Returns how many requests were
    /// cancelled.
    pub fn fail(&mut self, reason: &str) -> usize {
        if self.status.is_terminal() {
            return 0;
        }
        warn!(session_id = %self.session_id, reason, "session failed");
        let cancelled = self.cancel_pending();
        self.status = SessionStatus::Error;
        self.persist_status();
        cancelled
    }

    /// End the session. Cancels everything pending and moves to
    /// `completed` unless it already failed. Returns how many requests were
    /// cancelled.
    pub fn teardown(&mut self) -> usize {
        let cancelled = self.cancel_pending();
        if !self.status.is_terminal() {
            self.status = SessionStatus::Completed;
            self.persist_status();
        }
        info!(session_id = %self.session_id, cancelled, status = ?self.status, "session torn down");
        cancelled
    }
}
