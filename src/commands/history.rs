use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::display::history::render_history;
use crate::display::term_width;
use crate::session::history::{HistoryReport, load_history};

/// Print a persisted session and how cleanly it restored.
pub fn history<W: Write>(path: &Path, width: Option<usize>, out: &mut W) -> Result<HistoryReport> {
    let restored =
        load_history(path).with_context(|| format!("reading history {}", path.display()))?;
    render_history(out, &restored, width.unwrap_or_else(term_width))?;
    Ok(restored.report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_reported_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.jsonl");
        let err = history(&path, Some(80), &mut Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("nope.jsonl"));
    }

    #[test]
    fn prints_records_and_returns_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"message\",\"turn\":{\"role\":\"user\",\"blocks\":[{\"type\":\"text\",\"text\":\"hi there\"}]}}\ngarbage\n",
        )
        .unwrap();
        let mut out = Vec::new();
        let report = history(&path, Some(80), &mut out).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.skipped, 1);
        assert!(String::from_utf8(out).unwrap().contains("hi there"));
    }
}
