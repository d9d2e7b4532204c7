//! Pattern matching over accumulated session output.

use super::Match;
use regex::Regex;

/// Output received from a session and not yet consumed by a match
#[derive(Debug, Default, Clone)]
pub struct ExpectBuffer {
    pending: String,
}

impl ExpectBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Try to satisfy a wait for any of `patterns`.
    ///
    /// The pattern matching earliest in the buffer wins, ties going to the
    /// lower index. On success everything up to the end of the match is
    /// removed from the buffer.
    pub fn try_match(&mut self, patterns: &[Regex]) -> Option<Match> {
        let (index, start, end) = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, re)| re.find(&self.pending).map(|m| (i, m.start(), m.end())))
            .min_by_key(|(i, start, _)| (*start, *i))?;

        let after = self.pending[start..end].to_string();
        let before: String = self.pending.drain(..start).collect();
        self.pending = self.pending.split_off(end - start);

        Some(Match { index, before, after })
    }

    /// Drain the buffer, e.g. to report what arrived before a timeout
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Human readable pattern list for error messages
pub fn describe(patterns: &[Regex]) -> String {
    let list: Vec<&str> = patterns.iter().map(|p| p.as_str()).collect();
    format!("{:?}", list)
}
