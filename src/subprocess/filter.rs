//! Per-line output filters.
//!
//! Filters are attached to a [`SubprocessFixture`](super::SubprocessFixture)
//! and see every line of the stream they are attached to. The provided
//! filters are cheap handles over shared state: keep a clone to read the
//! results after the gather.

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use crate::error::{Error, Result};

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives subprocess output one line at a time.
pub trait LineFilter: Send {
    fn filter(&mut self, stream: Stream, line: &str);
}

impl<F> LineFilter for F
where
    F: FnMut(Stream, &str) + Send,
{
    fn filter(&mut self, stream: Stream, line: &str) {
        self(stream, line)
    }
}

/// Collects every line it sees.
#[derive(Debug, Clone, Default)]
pub struct LineAccumulator {
    lines: Arc<Mutex<Vec<(Stream, String)>>>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines, in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn lines_from(&self, stream: Stream) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// All lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl LineFilter for LineAccumulator {
    fn filter(&mut self, stream: Stream, line: &str) {
        self.lines.lock().push((stream, line.to_string()));
    }
}

#[derive(Debug, Default)]
struct MatchState {
    lines: Vec<String>,
    captures: Vec<Vec<Option<String>>>,
}

/// Records lines matching a regular expression, with their capture groups.
#[derive(Debug, Clone)]
pub struct LineMatcher {
    pattern: Regex,
    stream: Option<Stream>,
    state: Arc<Mutex<MatchState>>,
}

impl LineMatcher {
    /// Fails with [`Error::Config`] if `pattern` is not a valid regex.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid line pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern,
            stream: None,
            state: Arc::new(Mutex::new(MatchState::default())),
        })
    }

    /// Only consider lines from `stream`.
    pub fn on_stream(mut self, stream: Stream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn matched(&self) -> bool {
        !self.state.lock().lines.is_empty()
    }

    /// Matching lines, in arrival order.
    pub fn matches(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    /// Capture group `group` of the first matching line.
    pub fn first_capture(&self, group: usize) -> Option<String> {
        self.state
            .lock()
            .captures
            .first()
            .and_then(|caps| caps.get(group).cloned().flatten())
    }

    /// Capture group `group` of the last matching line.
    pub fn last_capture(&self, group: usize) -> Option<String> {
        self.state
            .lock()
            .captures
            .last()
            .and_then(|caps| caps.get(group).cloned().flatten())
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.lines.clear();
        state.captures.clear();
    }
}

impl LineFilter for LineMatcher {
    fn filter(&mut self, stream: Stream, line: &str) {
        if self.stream.is_some_and(|s| s != stream) {
            return;
        }
        if let Some(caps) = self.pattern.captures(line) {
            let groups = caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()))
                .collect();
            let mut state = self.state.lock();
            state.lines.push(line.to_string());
            state.captures.push(groups);
        }
    }
}
