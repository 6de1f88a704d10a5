//! Target output parser
//!
//! Turns the text streamed by a target into test outcomes. The target prints
//! boot noise, then `Ready.`, then for each test any number of free-form
//! output lines followed by one outcome line:
//!
//! ```text
//! Test passed: <Name>, <ticks>
//! Test failed: <Name>, <exception message>
//! Test skipped: <Name>, <reason>
//! ```
//!
//! and finally `Done.` once every test has run.

use super::model::{ticks_to_duration, MessageCategory, TestOutcome, TestResult};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, trace};

/// Line that opens the test section of the output
pub const READY_MARKER: &str = "Ready.";

/// Text that signals the target has run every loaded test
pub const DONE_MARKER: &str = "Done.";

/// Marker for a passed test
pub const PASSED_MARKER: &str = "Test passed: ";

/// Marker for a failed test
pub const FAILED_MARKER: &str = "Test failed: ";

/// Marker for a skipped test
pub const SKIPPED_MARKER: &str = "Test skipped: ";

/// Kind of outcome line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `Test passed: `
    Passed,
    /// `Test failed: `
    Failed,
    /// `Test skipped: `
    Skipped,
}

impl LineKind {
    fn outcome(self) -> TestOutcome {
        match self {
            Self::Passed => TestOutcome::Passed,
            Self::Failed => TestOutcome::Failed,
            Self::Skipped => TestOutcome::Skipped,
        }
    }
}

/// A recognised outcome line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeLine<'a> {
    /// Which marker matched
    pub kind: LineKind,
    /// Method display name
    pub name: &'a str,
    /// Tick count for passed lines, message otherwise
    pub detail: &'a str,
}

impl OutcomeLine<'_> {
    /// Tick count of a passed line, zero when absent or unparsable
    pub fn ticks(&self) -> i64 {
        self.detail.trim().parse().unwrap_or(0)
    }
}

// Tried in this order: a line carrying several markers resolves to the first.
static GRAMMAR: LazyLock<[(LineKind, Regex); 3]> = LazyLock::new(|| {
    [
        (LineKind::Passed, marker_regex(PASSED_MARKER)),
        (LineKind::Failed, marker_regex(FAILED_MARKER)),
        (LineKind::Skipped, marker_regex(SKIPPED_MARKER)),
    ]
});

fn marker_regex(marker: &str) -> Regex {
    let pattern = format!(
        r"{}(?P<name>[^,\s]+)(?:,\s?(?P<detail>.*))?",
        regex::escape(marker)
    );
    Regex::new(&pattern).expect("marker grammar is a valid pattern")
}

/// Match a single line against the outcome grammar
pub fn classify_line(line: &str) -> Option<OutcomeLine<'_>> {
    GRAMMAR.iter().find_map(|(kind, re)| {
        re.captures(line).and_then(|caps| {
            let name = caps.name("name")?.as_str();
            let detail = caps.name("detail").map_or("", |m| m.as_str());
            Some(OutcomeLine {
                kind: *kind,
                name,
                detail,
            })
        })
    })
}

/// Whether the accumulated output contains the completion marker
pub fn is_complete(output: &str) -> bool {
    output.contains(DONE_MARKER)
}

/// Counters reported after a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// `Ready.` was seen
    pub ready_seen: bool,
    /// Outcome lines that matched a result
    pub applied: usize,
    /// Outcome lines naming an unknown method
    pub unmatched: usize,
    /// Results skipped through setup propagation
    pub propagated: usize,
}

/// Line-driven state machine applying outcomes to a result set
pub struct OutputParser<'r> {
    results: &'r mut [TestResult],
    ready: bool,
    captured: String,
    stats: ParseStats,
}

impl<'r> OutputParser<'r> {
    /// Create a parser over the given results
    pub fn new(results: &'r mut [TestResult]) -> Self {
        Self {
            results,
            ready: false,
            captured: String::new(),
            stats: ParseStats::default(),
        }
    }

    /// Feed a whole block of text
    pub fn feed(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            self.feed_line(line);
        }
    }

    /// Feed one non-empty line
    pub fn feed_line(&mut self, line: &str) {
        if !self.ready {
            if line.trim_start().starts_with(READY_MARKER) {
                trace!("target ready");
                self.ready = true;
                self.stats.ready_seen = true;
            }
            return;
        }

        match classify_line(line) {
            Some(outcome) => {
                self.apply(&outcome);
                self.captured.clear();
            }
            None => {
                self.captured.push_str(line);
                self.captured.push('\n');
            }
        }
    }

    /// Finish the scan and return the counters
    pub fn finish(self) -> ParseStats {
        self.stats
    }

    fn apply(&mut self, line: &OutcomeLine<'_>) {
        let Some(index) = self
            .results
            .iter()
            .position(|r| r.test_case.display_name == line.name)
        else {
            debug!(name = line.name, "outcome for unknown test ignored");
            self.stats.unmatched += 1;
            return;
        };

        let captured = std::mem::take(&mut self.captured);
        let result = &mut self.results[index];
        result.outcome = line.kind.outcome();
        result.messages.clear();

        let category = match line.kind {
            LineKind::Passed => {
                result.duration = ticks_to_duration(line.ticks());
                result.error_message = None;
                MessageCategory::StandardOut
            }
            LineKind::Failed | LineKind::Skipped => {
                result.error_message = Some(line.detail.to_string());
                MessageCategory::StandardError
            }
        };
        if !captured.is_empty() {
            result.add_message(category, captured);
        }
        self.stats.applied += 1;

        if line.kind == LineKind::Skipped && result.test_case.is_setup() {
            self.propagate_skip(index);
        }
    }

    fn propagate_skip(&mut self, origin: usize) {
        let setup = &self.results[origin].test_case;
        let qualifier = setup.class_qualifier().to_string();
        if qualifier.is_empty() {
            return;
        }
        let message = format!(
            "Setup method '{}' has been skipped, skipping test",
            setup.display_name
        );

        for (i, result) in self.results.iter_mut().enumerate() {
            if i != origin && result.test_case.fully_qualified_name.contains(&qualifier) {
                result.outcome = TestOutcome::Skipped;
                result.error_message = Some(message.clone());
                self.stats.propagated += 1;
            }
        }
        debug!(%qualifier, "setup skip propagated");
    }
}

/// Scan `output` once and apply every outcome line to `results`
pub fn parse_output(output: &str, results: &mut [TestResult]) -> ParseStats {
    let mut parser = OutputParser::new(results);
    parser.feed(output);
    parser.finish()
}
