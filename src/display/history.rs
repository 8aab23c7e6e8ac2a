//! Plain-terminal rendering of a restored session history.

use std::io::{self, Write};

use crossterm::queue;
use crossterm::style::Print;
use unicode_width::UnicodeWidthChar;

use super::theme;
use crate::session::history::{HistoryRecord, HistoryReport, RestoredHistory};
use crate::session::message::{ContentBlock, Role, Turn};

/// Write one line per record followed by the restore summary.
pub fn render_history<W: Write>(
    out: &mut W,
    restored: &RestoredHistory,
    width: usize,
) -> io::Result<()> {
    let mut turn_no = 0;
    for record in &restored.records {
        match record {
            HistoryRecord::Session {
                session_id,
                cli_session_id,
                model,
                ..
            } => {
                let mut line = format!("session {session_id}");
                if let Some(cli) = cli_session_id {
                    line.push_str(&format!(" · agent {cli}"));
                }
                if let Some(model) = model {
                    line.push_str(&format!(" · {model}"));
                }
                queue!(
                    out,
                    Print(theme::dim().apply(truncate_to_width(&line, width))),
                    Print("\n")
                )?;
            }
            HistoryRecord::Message { turn } => {
                turn_no += 1;
                let (label, style) = match turn.role {
                    Role::User => ("user", theme::user_role()),
                    Role::Assistant => ("assistant", theme::assistant_role()),
                };
                let prefix = format!("[{turn_no}] {label:<9} ");
                let room = width.saturating_sub(prefix.chars().count());
                queue!(
                    out,
                    Print(style.apply(prefix)),
                    Print(truncate_to_width(&turn_preview(turn), room)),
                    Print("\n")
                )?;
            }
            HistoryRecord::Status { status } => {
                let line = serde_json::to_value(status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                queue!(out, Print(theme::dim().apply(format!("status: {line}"))), Print("\n"))?;
            }
        }
    }

    let report = &restored.report;
    let verdict = if report.is_corrupted() {
        theme::error().apply("corrupted")
    } else {
        theme::ok_line().apply("ok")
    };
    queue!(
        out,
        Print("\n"),
        Print(verdict),
        Print(theme::dim().apply(format!("  {}", summary_line(report)))),
        Print("\n")
    )?;
    out.flush()
}

/// `"3 records · 1 skipped · 0 orphan tool results"`
pub fn summary_line(report: &HistoryReport) -> String {
    let noun = if report.records == 1 { "record" } else { "records" };
    format!(
        "{} {noun} · {} skipped · {} orphan tool results",
        report.records, report.skipped, report.orphan_tool_results
    )
}

/// One-line gist of a turn's blocks.
pub fn turn_preview(turn: &Turn) -> String {
    turn.blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => first_line(text).to_string(),
            ContentBlock::Thinking { .. } => "(thinking)".to_string(),
            ContentBlock::ToolUse { name, .. } => format!("{name}(…)"),
            ContentBlock::ToolResult { is_error: true, .. } => "→ error".to_string(),
            ContentBlock::ToolResult { .. } => "→ result".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" · ")
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Truncate a string to fit within `max_width` display columns, appending `...` if truncated.
fn truncate_to_width(s: &str, max_width: usize) -> String {
    let ellipsis_width = 3;
    let mut width = 0;
    let mut cut_pos = 0;
    let mut result = String::new();
    for ch in s.chars() {
        let ch_width = ch.width().unwrap_or(0);
        if width + ch_width > max_width {
            if max_width >= ellipsis_width {
                result.truncate(cut_pos);
                result.push_str("...");
            } else {
                result.clear();
            }
            return result;
        }
        result.push(ch);
        width += ch_width;
        if width <= max_width.saturating_sub(ellipsis_width) {
            cut_pos = result.len();
        }
    }
    result
}
