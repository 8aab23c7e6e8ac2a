use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::types::TokenUsage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    #[default]
    Starting,
    Running,
    /// At least one permission or question is waiting on the user.
    AwaitingInput,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }
}

/// Running token and cost totals. Never decrease while the session lives.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_cost_usd: f64,
    pub num_turns: u32,
}

impl Usage {
    /// Add one turn's token counts.
    pub fn add_tokens(&mut self, tokens: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(tokens.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(tokens.output_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(tokens.cache_read_input_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(tokens.cache_creation_input_tokens);
    }

    /// Adopt the agent's cumulative cost and turn count. A report lower
    /// than what was already seen is ignored.
    pub fn observe_totals(&mut self, total_cost_usd: f64, num_turns: u32) {
        if total_cost_usd.is_finite() && total_cost_usd >= self.total_cost_usd {
            self.total_cost_usd = total_cost_usd;
        } else {
            warn!(
                reported = total_cost_usd,
                current = self.total_cost_usd,
                "ignoring cost regression"
            );
        }
        self.num_turns = self.num_turns.max(num_turns);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::AwaitingInput.is_terminal());
        assert!(!SessionStatus::Starting.is_terminal());
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::AwaitingInput).ok().as_deref(),
            Some("\"awaiting-input\"")
        );
    }

    #[test]
    fn cost_never_decreases() {
        let mut usage = Usage::default();
        usage.observe_totals(0.5, 2);
        usage.observe_totals(0.2, 1);
        assert!((usage.total_cost_usd - 0.5).abs() < f64::EPSILON);
        assert_eq!(usage.num_turns, 2);
        usage.observe_totals(f64::NAN, 3);
        assert!((usage.total_cost_usd - 0.5).abs() < f64::EPSILON);
        assert_eq!(usage.num_turns, 3);
    }

    #[test]
    fn tokens_accumulate() {
        let mut usage = Usage::default();
        let turn = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_input_tokens: 100,
            cache_creation_input_tokens: 1,
        };
        usage.add_tokens(&turn);
        usage.add_tokens(&turn);
        assert_eq!(usage.total_tokens(), 232);
    }
}
