//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Bounded buffer of recent output lines."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::collections::VecDeque;

/// Number of trailing lines attached to a failure message.
pub const FAILURE_TAIL_LINES: usize = 20;

/// Keeps the most recent `limit` lines of output.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    limit: usize,
    lines: VecDeque<String>,
    partial: String,
}

impl LineBuffer {
    /// Buffer retaining at most `limit` lines.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            lines: VecDeque::with_capacity(limit),
            partial: String::new(),
        }
    }

    /// Append raw output. Chunks may end mid-line; the remainder is kept until
    /// the next newline.
    pub fn push(&mut self, chunk: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            self.push_line(line.trim_end_matches(['\n', '\r']).to_owned());
        }
    }

    fn push_line(&mut self, line: String) {
        if self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Retained lines, oldest first, including an unterminated trailing line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(self.partial.clone());
            if lines.len() > self.limit {
                lines.remove(0);
            }
        }
        lines
    }

    /// Retained lines joined with newlines.
    pub fn joined(&self) -> String {
        self.lines().join("\n")
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }
}
