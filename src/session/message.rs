use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::types::{
    AssistantContentBlock, AssistantMessage, UserContent, UserContentBlock, UserMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// One role-tagged entry in a session's history.
///
/// Partial events of the same assistant message share an `id` and are
/// merged into one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Ids of the tool calls this turn makes.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids of the tool calls this turn answers.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

impl From<&AssistantMessage> for Turn {
    fn from(msg: &AssistantMessage) -> Self {
        let blocks = msg
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                AssistantContentBlock::Text { text } => {
                    Some(ContentBlock::Text { text: text.clone() })
                }
                AssistantContentBlock::Thinking { thinking } => Some(ContentBlock::Thinking {
                    thinking: thinking.clone(),
                }),
                AssistantContentBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                AssistantContentBlock::Other => None,
            })
            .collect();
        Self {
            id: msg.message.id.clone(),
            role: Role::Assistant,
            blocks,
        }
    }
}

impl From<&UserMessage> for Turn {
    fn from(msg: &UserMessage) -> Self {
        let blocks = match msg.message.as_ref().map(|m| &m.content) {
            Some(UserContent::Text(text)) => vec![ContentBlock::Text { text: text.clone() }],
            Some(UserContent::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|block| match block {
                    UserContentBlock::Text { text } => {
                        Some(ContentBlock::Text { text: text.clone() })
                    }
                    UserContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                        is_error: *is_error,
                    }),
                    UserContentBlock::Other => None,
                })
                .collect(),
            None => Vec::new(),
        };
        Self {
            id: None,
            role: Role::User,
            blocks,
        }
    }
}
