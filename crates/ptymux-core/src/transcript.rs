//! In-memory request/response transcript.
//!
//! Informational only: entries are never replayed into the child. Bounded;
//! the oldest entry is evicted once `max_entries` is reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Text written to the child.
    Request,
    /// Sanitized text framed out of the child's output.
    Response,
}

/// A single timestamped entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub direction: Direction,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    max_entries: usize,
}

impl Transcript {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn record(&mut self, direction: Direction, text: impl Into<String>) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(TranscriptEntry {
            direction,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newline-delimited JSON, one entry per line. Entries that fail to
    /// serialize are logged and skipped.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                Err(e) => error!(error = %e, "failed to serialize transcript entry"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut t = Transcript::new(10);
        t.record(Direction::Request, "list pods");
        t.record(Direction::Response, "There are 3 pods.");
        let entries = t.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].direction, Direction::Request);
        assert_eq!(entries[1].text, "There are 3 pods.");
        assert!(entries[0].at <= entries[1].at);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut t = Transcript::new(3);
        for i in 0..5 {
            t.record(Direction::Request, format!("msg {i}"));
        }
        let texts: Vec<_> = t.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn jsonl_lines_parse_back() {
        let mut t = Transcript::new(5);
        t.record(Direction::Request, "hello");
        t.record(Direction::Response, "hello world.");
        let dump = t.to_jsonl();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""direction":"request""#));
        let back: TranscriptEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.direction, Direction::Response);
        assert_eq!(back.text, "hello world.");
    }
}
