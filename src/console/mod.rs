//! Device console access
//!
//! A [`Connection`] is the line-oriented channel to a board's serial
//! console: type a line, then wait until one of several patterns shows up
//! in the output, the deadline passes, or the stream ends.

pub mod pty;
pub mod transcript;

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

use crate::error::Result;

pub use pty::PtyConnection;
pub use transcript::Transcript;

/// What an [`expect`](Connection::expect) call observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectOutcome {
    /// One of the patterns matched
    Matched(ExpectMatch),
    /// Nothing matched before the deadline
    Timeout,
    /// The console stream ended
    Eof,
}

/// A successful pattern match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the matching pattern in the slice passed to `expect`
    pub index: usize,
    /// Capture groups 1..n of the matching pattern
    pub groups: Vec<Option<String>>,
    /// Named `rc` capture, when the pattern has one
    pub rc: Option<String>,
    /// Output consumed before the match
    pub before: String,
    /// The matched text itself
    pub text: String,
}

impl ExpectMatch {
    /// First capture group, if it participated in the match
    pub fn first_group(&self) -> Option<&str> {
        self.groups.first().and_then(|g| g.as_deref())
    }
}

/// Line-oriented interactive channel to a device console
#[async_trait]
pub trait Connection: Send {
    /// Send one line of input, terminated by a newline
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Wait for the earliest match of any pattern
    ///
    /// Output up to the end of the match is consumed. A timeout or the end
    /// of the stream is reported in the outcome, not as an error; errors are
    /// reserved for the channel itself failing.
    async fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ExpectOutcome>;
}

/// Find the earliest match of any pattern in `buffer`
///
/// Ties at the same offset go to the pattern listed first. Returns the
/// match together with the byte offset where consumption should stop.
pub fn search(buffer: &str, patterns: &[Regex]) -> Option<(ExpectMatch, usize)> {
    let mut best: Option<(usize, regex::Captures<'_>)> = None;

    for (index, pattern) in patterns.iter().enumerate() {
        if let Some(caps) = pattern.captures(buffer) {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            let better = match &best {
                Some((_, current)) => {
                    start < current.get(0).map(|m| m.start()).unwrap_or(usize::MAX)
                }
                None => true,
            };
            if better {
                best = Some((index, caps));
            }
        }
    }

    best.and_then(|(index, caps)| {
        let whole = caps.get(0)?;
        let groups = caps
            .iter()
            .skip(1)
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        let rc = caps.name("rc").map(|m| m.as_str().to_string());
        let found = ExpectMatch {
            index,
            groups,
            rc,
            before: buffer[..whole.start()].to_string(),
            text: whole.as_str().to_string(),
        };
        Some((found, whole.end()))
    })
}

/// Human-readable description of what an expect call waited for
pub fn describe(patterns: &[Regex]) -> String {
    patterns
        .iter()
        .map(|p| format!("/{}/", p.as_str()))
        .collect::<Vec<_>>()
        .join(" | ")
}
