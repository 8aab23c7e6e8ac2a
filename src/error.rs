/// Errors surfaced by the relay and session bridge.
///
/// `Decode` and `CorruptHistoryRecord` are recovered where they occur
/// (the sequence or record is dropped and processing continues); they are
/// still typed so callers that want to log or count them can.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid session configuration: {0}")]
    Configuration(String),
    #[error("no pending request for token '{0}'")]
    UnknownToken(String),
    #[error("request token '{0}' is already pending")]
    DuplicateToken(String),
    #[error("invalid answer: {0}")]
    InvalidAnswer(String),
    #[error("invalid clipboard payload: {0}")]
    Decode(String),
    #[error("corrupt history record at line {line}: {reason}")]
    CorruptHistoryRecord { line: usize, reason: String },
    #[error("tool result references unknown tool use '{0}'")]
    OrphanToolResult(String),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session is closed")]
    SessionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
