use serde::{Deserialize, Serialize};

use crate::protocol::types::InboundEvent;

/// Unified event consumed by a session's driver loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// An event parsed from the agent's stdout stream.
    Agent(Box<InboundEvent>),
    /// A warning about an unparseable line from the agent's stdout.
    ParseWarning(String),
    /// Content from the agent's stderr.
    Stderr(String),
    /// The agent process has exited.
    ProcessExit(Option<i32>),
}
