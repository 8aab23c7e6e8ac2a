//! Append-only session history, one JSON record per line.
//!
//! Readers are tolerant: a line that does not parse is skipped and counted,
//! and a tool result with no earlier tool use (an orphan) is dropped and
//! counted. A history with any orphan is classified as corrupted, the same
//! rule external scanners apply. The writer never produces an orphan.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::message::{ContentBlock, Turn};
use super::state::SessionStatus;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    Session {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cli_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Message {
        turn: Turn,
    },
    Status {
        status: SessionStatus,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryReport {
    /// Records kept.
    pub records: usize,
    /// Lines that could not be parsed.
    pub skipped: usize,
    /// Tool results dropped for lack of a matching tool use.
    pub orphan_tool_results: usize,
}

impl HistoryReport {
    pub fn is_corrupted(&self) -> bool {
        self.orphan_tool_results > 0
    }
}

#[derive(Debug, Default)]
pub struct RestoredHistory {
    pub records: Vec<HistoryRecord>,
    pub report: HistoryReport,
}

/// Parse a whole history buffer.
pub fn parse_history(data: &[u8]) -> RestoredHistory {
    let mut restored = RestoredHistory::default();
    let mut tool_uses = HashSet::new();

    for (idx, raw) in data.split(|&b| b == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let mut record = match serde_json::from_slice::<HistoryRecord>(raw) {
            Ok(record) => record,
            Err(e) => {
                let err = BridgeError::CorruptHistoryRecord {
                    line: idx + 1,
                    reason: e.to_string(),
                };
                warn!(error = %err, "skipping history record");
                restored.report.skipped += 1;
                continue;
            }
        };

        if let HistoryRecord::Message { turn } = &mut record {
            let dropped = drop_orphans(turn, &mut tool_uses);
            if dropped > 0 {
                debug!(line = idx + 1, dropped, "orphan tool results dropped");
                restored.report.orphan_tool_results += dropped;
                if turn.blocks.is_empty() {
                    continue;
                }
            }
        }
        restored.records.push(record);
        restored.report.records += 1;
    }
    restored
}

/// Read and parse the history file at `path`.
pub fn load_history(path: &Path) -> Result<RestoredHistory> {
    let data = std::fs::read(path)?;
    Ok(parse_history(&data))
}

/// Remember the turn's tool uses, then remove results that answer a tool
/// use never seen. Returns how many were removed.
fn drop_orphans(turn: &mut Turn, tool_uses: &mut HashSet<String>) -> usize {
    tool_uses.extend(turn.tool_use_ids().map(str::to_string));
    let before = turn.blocks.len();
    turn.blocks.retain(|block| match block {
        ContentBlock::ToolResult { tool_use_id, .. } => tool_uses.contains(tool_use_id),
        _ => true,
    });
    before - turn.blocks.len()
}

/// Appends records to a history file under an exclusive lock.
pub struct HistoryWriter {
    file: File,
    path: PathBuf,
    tool_uses: HashSet<String>,
}

impl HistoryWriter {
    /// Open `path` for appending, creating it if needed. Tool uses already
    /// in the file count as prior for later results.
    pub fn open(path: &Path) -> Result<Self> {
        let mut tool_uses = HashSet::new();
        if path.exists() {
            for record in load_history(path)?.records {
                if let HistoryRecord::Message { turn } = record {
                    tool_uses.extend(turn.tool_use_ids().map(str::to_string));
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            tool_uses,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Count tool uses recorded elsewhere (an earlier history segment) as
    /// prior for later results.
    pub fn remember_tool_uses<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        self.tool_uses.extend(ids.into_iter().map(str::to_string));
    }

    /// Check that every tool result in `turn` answers a known tool use.
    pub fn check_turn(&self, turn: &Turn) -> Result<()> {
        let own: HashSet<&str> = turn.tool_use_ids().collect();
        match turn
            .tool_result_ids()
            .find(|id| !own.contains(id) && !self.tool_uses.contains(*id))
        {
            Some(orphan) => Err(BridgeError::OrphanToolResult(orphan.to_string())),
            None => Ok(()),
        }
    }

    pub fn append(&mut self, record: &HistoryRecord) -> Result<()> {
        if let HistoryRecord::Message { turn } = record {
            self.check_turn(turn)?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        FileExt::lock_exclusive(&self.file)?;
        let written = self.file.write_all(&line).and_then(|()| self.file.flush());
        FileExt::unlock(&self.file)?;
        written?;

        if let HistoryRecord::Message { turn } = record {
            self.tool_uses
                .extend(turn.tool_use_ids().map(str::to_string));
        }
        Ok(())
    }
}
