//! Append-only history log (`.ralph-mode/history.jsonl`).
//!
//! One JSON record per line. Records are only ever appended; the log is never
//! read back to reconstruct loop state.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::HistoryEntry;

/// Append one record as a single write so concurrent appenders never interleave.
pub fn append_entry(path: &Path, entry: &HistoryEntry) -> Result<()> {
    let mut line = serde_json::to_string(entry).context("serialize history entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open history {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append history {}", path.display()))
}

/// Read all parseable records; malformed lines are skipped.
pub fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("open history {}", path.display())),
    };
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read history {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => debug!(line = index + 1, err = %err, "skipping malformed history line"),
        }
    }
    Ok(entries)
}

/// Number of non-blank lines in the log.
pub fn count_entries(path: &Path) -> Result<usize> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("open history {}", path.display())),
    };
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read history {}", path.display()))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::HistoryEvent;
    use chrono::Utc;

    #[test]
    fn appends_and_skips_malformed_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("history.jsonl");

        append_entry(&path, &HistoryEntry::new(HistoryEvent::Started, 1, Utc::now()))
            .expect("append");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(b"{not json\n"))
            .expect("append garbage");
        append_entry(
            &path,
            &HistoryEntry::new(HistoryEvent::Iterate, 2, Utc::now()).with_notes("again"),
        )
        .expect("append");

        let entries = read_entries(&path).expect("read");
        let events: Vec<_> = entries.iter().map(|e| e.event).collect();
        assert_eq!(events, vec![HistoryEvent::Started, HistoryEvent::Iterate]);
        assert_eq!(count_entries(&path).expect("count"), 3);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("history.jsonl");
        assert!(read_entries(&path).expect("read").is_empty());
        assert_eq!(count_entries(&path).expect("count"), 0);
    }
}
