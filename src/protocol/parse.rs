use super::types::InboundEvent;
use crate::error::Result;

/// Parse a single NDJSON line into an `InboundEvent`.
///
/// Returns `Ok(None)` for empty lines.
/// Returns `Err` for malformed JSON (caller should warn, not crash).
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: InboundEvent = serde_json::from_str(line)?;
    Ok(Some(event))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::types::{ControlRequestBody, SystemEvent};

    #[test]
    fn parse_empty_line() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("  \n").unwrap().is_none());
    }

    #[test]
    fn unknown_fields_dont_crash() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.01,"num_turns":1,"duration_ms":100,"result":"ok","session_id":"x","unknown_field":"value","another":123}"#;
        assert!(parse_line(line).is_ok());
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta"}}"#;
        assert!(matches!(parse_line(line).unwrap(), Some(InboundEvent::Other)));
    }

    #[test]
    fn parse_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus","cwd":"/w","tools":[]}"#;
        let Some(InboundEvent::System(SystemEvent::Init(init))) = parse_line(line).unwrap() else {
            unreachable!("expected init");
        };
        assert_eq!(init.session_id, "abc");
        assert_eq!(init.cwd.as_deref(), Some("/w"));
    }

    #[test]
    fn parse_can_use_tool() {
        let line = r#"{"type":"control_request","request_id":"req-7","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"make"},"permission_suggestions":[{"type":"addRules"}]}}"#;
        let Some(InboundEvent::ControlRequest(req)) = parse_line(line).unwrap() else {
            unreachable!("expected control request");
        };
        assert_eq!(req.request_id, "req-7");
        let ControlRequestBody::CanUseTool(tool) = req.request else {
            unreachable!("expected can_use_tool");
        };
        assert_eq!(tool.tool_name, "Bash");
        assert_eq!(tool.permission_suggestions.len(), 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_line("{\"type\":").is_err());
    }
}
