//! Reader for the leveled progress log written by the package build tool.
//!
//! Level lines start with one or more `*`; the number of stars minus one is
//! the level. Their text may end with a status (`OK`, `NOTE`, ...) and starts
//! with `DONE` when the tool has finished successfully:
//!
//! ```text
//! * installing *source* package 'foo' ...
//! ** R
//! ** preparing package for lazy loading
//! Creating a generic function for 'summary' from package 'base' in package 'foo'
//! * DONE (foo)
//! ```
//!
//! Every other line belongs to the message opened by the last level line.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Deepest level that is tracked.
pub const MAX_LEVELS: usize = 10;

const DONE_MARKER: &str = "DONE";

static LEVEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\*+)\s*(.+)").expect("level pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgressStatus {
    Warning,
    Ok,
    Note,
    Skipped,
    Error,
}

impl ProgressStatus {
    const ALL: [ProgressStatus; 5] = [
        ProgressStatus::Warning,
        ProgressStatus::Ok,
        ProgressStatus::Note,
        ProgressStatus::Skipped,
        ProgressStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Warning => "WARNING",
            ProgressStatus::Ok => "OK",
            ProgressStatus::Note => "NOTE",
            ProgressStatus::Skipped => "SKIPPED",
            ProgressStatus::Error => "ERROR",
        }
    }

    /// The status a level line ends with, if any.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim_end();
        Self::ALL
            .into_iter()
            .find(|status| label.ends_with(status.as_str()))
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One block of the log: the open level labels plus the lines below them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub levels: Vec<String>,
    pub lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
}

/// Number of level lines seen per status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts(BTreeMap<ProgressStatus, u32>);

impl StatusCounts {
    pub fn get(&self, status: ProgressStatus) -> u32 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    fn increment(&mut self, status: ProgressStatus) {
        *self.0.entry(status).or_default() += 1;
    }
}

/// Line-at-a-time state machine behind [`ProgressLogReader`].
#[derive(Debug, Default)]
pub struct ProgressParser {
    levels: [Option<String>; MAX_LEVELS],
    max_level: usize,
    lines: Vec<String>,
    status: Option<ProgressStatus>,
    counts: StatusCounts,
    done: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns the message closed by it, if worth emitting.
    pub fn push_line(&mut self, line: &str) -> Option<ProgressMessage> {
        let Some(captures) = LEVEL_PATTERN.captures(line) else {
            self.lines.push(line.to_string());
            return None;
        };

        let level = (captures[1].len() - 1).min(MAX_LEVELS - 1);
        let label = captures[2].trim_end().to_string();

        let message = self.flush();
        self.open_level(level, label);
        message
    }

    /// Closes the last message at end of input.
    pub fn finish(&mut self) -> Option<ProgressMessage> {
        self.flush()
    }

    pub fn counts(&self) -> &StatusCounts {
        &self.counts
    }

    /// Whether the tool reported completion.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn open_level(&mut self, level: usize, label: String) {
        if label.starts_with(DONE_MARKER) {
            self.done = true;
        }

        self.status = ProgressStatus::from_label(&label);
        if let Some(status) = self.status {
            self.counts.increment(status);
        }

        if level < self.max_level {
            for slot in &mut self.levels[level..=self.max_level] {
                *slot = None;
            }
        }
        self.levels[level] = Some(label);
        self.max_level = level;
    }

    fn flush(&mut self) -> Option<ProgressMessage> {
        let status = self.status.take();
        let lines = std::mem::take(&mut self.lines);

        if lines.is_empty() && status.is_none_or(|s| s == ProgressStatus::Ok) {
            return None;
        }

        let levels = self.levels[..=self.max_level]
            .iter()
            .flatten()
            .cloned()
            .collect();

        Some(ProgressMessage {
            levels,
            lines,
            status,
        })
    }
}

/// Lazy, finite iterator over the messages of a progress log.
pub struct ProgressLogReader<R> {
    input: io::Lines<R>,
    parser: ProgressParser,
    finished: bool,
}

impl<R: BufRead> ProgressLogReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: input.lines(),
            parser: ProgressParser::new(),
            finished: false,
        }
    }

    pub fn counts(&self) -> &StatusCounts {
        self.parser.counts()
    }

    pub fn is_done(&self) -> bool {
        self.parser.is_done()
    }
}

impl<R: BufRead> Iterator for ProgressLogReader<R> {
    type Item = io::Result<ProgressMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.input.next() {
                Some(Ok(line)) => {
                    if let Some(message) = self.parser.push_line(&line) {
                        return Some(Ok(message));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return self.parser.finish().map(Ok);
                }
            }
        }
    }
}
