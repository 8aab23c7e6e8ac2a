use serde_json::{Map, Value};

use super::types::{
    ControlResponse, ControlResponseBody, OutboundMessage, OutboundMessageBody, PermissionResult,
};
use crate::session::pending::{PermissionDecision, QuestionDecision, QuestionRequest};

const CANCELLED_MESSAGE: &str = "session closed before a decision was made";

/// Format a user message as NDJSON for writing to the agent's stdin.
///
/// # Errors
///
/// Returns an error if JSON serialization fails (should not happen in practice).
pub fn format_user_message(text: &str) -> serde_json::Result<String> {
    let msg = OutboundMessage {
        r#type: "user".to_string(),
        message: OutboundMessageBody {
            role: "user".to_string(),
            content: text.to_string(),
        },
    };
    serde_json::to_string(&msg)
}

fn control_response(request_id: &str, result: PermissionResult) -> serde_json::Result<String> {
    serde_json::to_string(&ControlResponse {
        r#type: "control_response".to_string(),
        response: ControlResponseBody {
            subtype: "success".to_string(),
            request_id: request_id.to_string(),
            response: result,
        },
    })
}

/// Answer a `can_use_tool` request. `original_input` is echoed back as the
/// tool input unless the decision replaces it.
pub fn format_permission_response(
    request_id: &str,
    decision: &PermissionDecision,
    original_input: &Value,
) -> serde_json::Result<String> {
    let result = match decision {
        PermissionDecision::Allow => PermissionResult::Allow {
            updated_input: original_input.clone(),
            updated_permissions: None,
        },
        PermissionDecision::AllowWithModifications {
            updated_input,
            updated_permissions,
        } => PermissionResult::Allow {
            updated_input: updated_input.clone().unwrap_or_else(|| original_input.clone()),
            updated_permissions: (!updated_permissions.is_empty())
                .then(|| updated_permissions.clone()),
        },
        PermissionDecision::Deny { message } => PermissionResult::Deny {
            message: message
                .clone()
                .unwrap_or_else(|| "denied by user".to_string()),
            interrupt: false,
        },
        PermissionDecision::Cancelled => PermissionResult::Deny {
            message: CANCELLED_MESSAGE.to_string(),
            interrupt: true,
        },
    };
    control_response(request_id, result)
}

/// Answer an `AskUserQuestion` permission. Answers ride back in the tool
/// input under `answers`, keyed by question text; multiple selections are
/// comma-joined.
pub fn format_question_response(
    request_id: &str,
    request: &QuestionRequest,
    decision: &QuestionDecision,
    original_input: &Value,
) -> serde_json::Result<String> {
    let result = match decision {
        QuestionDecision::Answered(answers) => {
            let mut input = match original_input {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            let answers: Map<String, Value> = request
                .questions
                .iter()
                .zip(answers)
                .map(|(item, selected)| (item.question.clone(), Value::String(selected.join(", "))))
                .collect();
            input.insert("answers".to_string(), Value::Object(answers));
            PermissionResult::Allow {
                updated_input: Value::Object(input),
                updated_permissions: None,
            }
        }
        QuestionDecision::Cancelled => PermissionResult::Deny {
            message: CANCELLED_MESSAGE.to_string(),
            interrupt: true,
        },
    };
    control_response(request_id, result)
}
