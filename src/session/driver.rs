//! Feeds agent events into a session bridge and writes decisions back.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::message::Turn;
use super::pending::{PermissionRequest, QuestionRequest};
use super::registry::{KnownSessions, SharedBridge};
use crate::error::BridgeError;
use crate::event::AppEvent;
use crate::protocol::emit::{format_permission_response, format_question_response};
use crate::protocol::types::{
    ASK_USER_QUESTION, CanUseTool, ControlRequest, ControlRequestBody, InboundEvent, SystemEvent,
};
use crate::session::pending::{Cancellable, PermissionDecision, QuestionDecision};

/// How a call to [`SessionDriver::handle`] left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The agent process is gone; the session has been closed.
    Ended,
}

/// Sent when a request starts waiting on the user.
#[derive(Debug, Clone)]
pub enum RequestNotice {
    Permission {
        token: String,
        request: PermissionRequest,
    },
    Question {
        token: String,
        request: QuestionRequest,
    },
}

pub struct SessionDriver {
    bridge: SharedBridge,
    /// NDJSON lines for the agent's stdin.
    outbound: mpsc::UnboundedSender<String>,
    known: Option<KnownSessions>,
    notices: Option<mpsc::UnboundedSender<RequestNotice>>,
}

impl SessionDriver {
    pub fn new(bridge: SharedBridge, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            bridge,
            outbound,
            known: None,
            notices: None,
        }
    }

    /// Announce every parked request on `notices`.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<RequestNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    fn notify(&self, notice: RequestNotice) {
        if let Some(tx) = &self.notices
            && tx.send(notice).is_err()
        {
            debug!("request notice receiver closed");
        }
    }

    /// Record the agent's session id in `known` once it reports one.
    pub fn with_known_sessions(mut self, known: KnownSessions) -> Self {
        self.known = Some(known);
        self
    }

    /// Drive the session until the agent exits or the event source closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<AppEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await == Flow::Ended {
                return;
            }
        }
        self.bridge.lock().await.fail("agent event stream closed");
    }

    pub async fn handle(&self, event: AppEvent) -> Flow {
        match event {
            AppEvent::Agent(event) => {
                self.handle_inbound(*event).await;
                Flow::Continue
            }
            AppEvent::ParseWarning(warning) => {
                warn!("{warning}");
                Flow::Continue
            }
            AppEvent::Stderr(text) => {
                debug!(stderr = %text, "agent stderr");
                Flow::Continue
            }
            AppEvent::ProcessExit(code) => {
                let mut bridge = self.bridge.lock().await;
                match code {
                    Some(0) => {
                        bridge.teardown();
                    }
                    Some(code) => {
                        bridge.fail(&format!("agent exited with code {code}"));
                    }
                    None => {
                        bridge.fail("agent exited without a status");
                    }
                }
                Flow::Ended
            }
        }
    }

    async fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::System(SystemEvent::Init(init)) => {
                let history = {
                    let mut bridge = self.bridge.lock().await;
                    bridge.mark_running(Some(&init.session_id));
                    bridge.history_path().map(std::path::Path::to_path_buf)
                };
                if let Some(known) = self.known.as_ref().filter(|_| !init.session_id.is_empty()) {
                    known.insert(init.session_id, history).await;
                }
            }
            InboundEvent::System(SystemEvent::Other) | InboundEvent::Other => {}
            InboundEvent::Assistant(msg) => {
                if msg.parent_tool_use_id.is_some() {
                    trace!("subagent message not recorded");
                    return;
                }
                self.append(Turn::from(&msg)).await;
            }
            InboundEvent::User(msg) => {
                if msg.parent_tool_use_id.is_some() {
                    trace!("subagent message not recorded");
                    return;
                }
                self.append(Turn::from(&msg)).await;
            }
            InboundEvent::Result(result) => {
                if result.is_error {
                    warn!(subtype = %result.subtype, "agent turn ended with an error");
                }
                self.bridge.lock().await.record_usage(
                    result.usage.as_ref(),
                    result.total_cost_usd,
                    result.num_turns,
                );
            }
            InboundEvent::ControlRequest(req) => {
                self.handle_control_request(req).await;
            }
        }
    }

    async fn append(&self, turn: Turn) {
        if turn.blocks.is_empty() {
            return;
        }
        if let Err(e) = self.bridge.lock().await.append_message(turn) {
            warn!(error = %e, "message not recorded");
        }
    }

    async fn handle_control_request(&self, req: ControlRequest) {
        let ControlRequestBody::CanUseTool(tool) = req.request else {
            warn!(request_id = %req.request_id, "unsupported control request");
            return;
        };
        if tool.tool_name == ASK_USER_QUESTION {
            if let Ok(question) = serde_json::from_value::<QuestionRequest>(tool.input.clone()) {
                self.ask_question(req.request_id, question, tool.input).await;
                return;
            }
            debug!(request_id = %req.request_id, "malformed question input, asking as permission");
        }
        self.ask_permission(req.request_id, tool).await;
    }

    async fn ask_permission(&self, request_id: String, tool: CanUseTool) {
        let input = tool.input.clone();
        let request = PermissionRequest {
            tool_name: tool.tool_name,
            tool_input: tool.input,
            suggestions: tool.permission_suggestions,
            reason: tool.decision_reason.or(tool.blocked_path),
        };
        let registered = self
            .bridge
            .lock()
            .await
            .register_permission_request(request_id.clone(), request.clone());
        let pending = match registered {
            Ok(pending) => pending,
            Err(e) => {
                self.refuse(&request_id, &e, |id| {
                    format_permission_response(id, &PermissionDecision::cancelled(), &input)
                });
                return;
            }
        };
        self.notify(RequestNotice::Permission {
            token: request_id.clone(),
            request,
        });

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let decision = pending.await;
            send_line(
                &outbound,
                &request_id,
                format_permission_response(&request_id, &decision, &input),
            );
        });
    }

    async fn ask_question(
        &self,
        request_id: String,
        question: QuestionRequest,
        input: Value,
    ) {
        let registered = self
            .bridge
            .lock()
            .await
            .register_question_request(request_id.clone(), question.clone());
        let pending = match registered {
            Ok(pending) => pending,
            Err(e) => {
                self.refuse(&request_id, &e, |id| {
                    format_question_response(id, &question, &QuestionDecision::cancelled(), &input)
                });
                return;
            }
        };
        self.notify(RequestNotice::Question {
            token: request_id.clone(),
            request: question.clone(),
        });

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let decision = pending.await;
            send_line(
                &outbound,
                &request_id,
                format_question_response(&request_id, &question, &decision, &input),
            );
        });
    }

    /// The request could not be parked; answer it right away so the agent
    /// is not left waiting.
    fn refuse(
        &self,
        request_id: &str,
        error: &BridgeError,
        format: impl FnOnce(&str) -> serde_json::Result<String>,
    ) {
        warn!(request_id, error = %error, "request refused");
        send_line(&self.outbound, request_id, format(request_id));
    }
}

fn send_line(
    outbound: &mpsc::UnboundedSender<String>,
    request_id: &str,
    line: serde_json::Result<String>,
) {
    match line {
        Ok(line) => {
            if outbound.send(line).is_err() {
                debug!(request_id, "agent input closed, response dropped");
            }
        }
        Err(e) => warn!(request_id, error = %e, "failed to encode response"),
    }
}
