//! Test cases, results and the pending result scaffold
//!
//! A [`TestCase`] is produced by discovery and never changes. Each one gets
//! exactly one [`TestResult`], created `Pending` by [`build_scaffold`] and
//! later moved to a terminal outcome by the output parser or by an
//! orchestrator short-circuit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the trait that classifies a test method
pub const TYPE_TRAIT: &str = "Type";

/// Value of [`TYPE_TRAIT`] marking a class-level setup method
pub const SETUP_TRAIT_VALUE: &str = "Setup";

/// A `(name, value)` trait attached to a test method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTrait {
    /// Trait name
    pub name: String,
    /// Trait value
    pub value: String,
}

impl TestTrait {
    /// Create a new trait pair
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The `Type=Setup` trait
    pub fn setup() -> Self {
        Self::new(TYPE_TRAIT, SETUP_TRAIT_VALUE)
    }
}

/// One discovered test method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Fully-qualified name, e.g. `Tests.Math.Add`
    pub fully_qualified_name: String,
    /// Name as printed by the target, e.g. `Add`
    pub display_name: String,
    /// Image the test was compiled into
    pub source: PathBuf,
    /// Attached traits
    #[serde(default)]
    pub traits: Vec<TestTrait>,
}

impl TestCase {
    /// Create a test case without traits
    pub fn new(
        fully_qualified_name: impl Into<String>,
        display_name: impl Into<String>,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fully_qualified_name: fully_qualified_name.into(),
            display_name: display_name.into(),
            source: source.into(),
            traits: Vec::new(),
        }
    }

    /// Attach a trait
    #[must_use]
    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.push(TestTrait::new(name, value));
        self
    }

    /// Whether this method carries the `Type=Setup` trait
    pub fn is_setup(&self) -> bool {
        self.traits
            .iter()
            .any(|t| t.name == TYPE_TRAIT && t.value == SETUP_TRAIT_VALUE)
    }

    /// Everything before the final `.` segment of the fully-qualified name
    pub fn class_qualifier(&self) -> &str {
        self.fully_qualified_name
            .rsplit_once('.')
            .map_or("", |(qualifier, _)| qualifier)
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestOutcome {
    /// Not yet reported by the target
    #[default]
    Pending,
    /// Passed
    Passed,
    /// Failed
    Failed,
    /// Skipped
    Skipped,
}

impl TestOutcome {
    /// Whether the outcome is final
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Passed => write!(f, "Passed"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Stream an output message was captured as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCategory {
    /// Standard output
    StandardOut,
    /// Standard error
    StandardError,
}

/// Output captured while a test ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    /// Category
    pub category: MessageCategory,
    /// Text
    pub text: String,
}

/// Result of one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// The test this result belongs to
    pub test_case: TestCase,
    /// Current outcome
    pub outcome: TestOutcome,
    /// Reported duration
    pub duration: Duration,
    /// Error or skip message
    pub error_message: Option<String>,
    /// Captured output, in order
    pub messages: Vec<OutputMessage>,
}

impl TestResult {
    /// Create a pending result
    pub fn pending(test_case: TestCase) -> Self {
        Self {
            test_case,
            outcome: TestOutcome::Pending,
            duration: Duration::ZERO,
            error_message: None,
            messages: Vec::new(),
        }
    }

    /// Attach output under the given category
    pub fn add_message(&mut self, category: MessageCategory, text: impl Into<String>) {
        self.messages.push(OutputMessage {
            category,
            text: text.into(),
        });
    }

    /// Force the result to `Failed` with a message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.outcome = TestOutcome::Failed;
        self.error_message = Some(message.into());
    }
}

/// Build one `Pending` result per test case, in input order
pub fn build_scaffold(tests: &[TestCase]) -> Vec<TestResult> {
    tests.iter().cloned().map(TestResult::pending).collect()
}

/// Convert a tick count (100 ns units) into a [`Duration`]
///
/// Negative counts clamp to zero.
pub fn ticks_to_duration(ticks: i64) -> Duration {
    let ticks = u64::try_from(ticks).unwrap_or(0);
    Duration::from_secs(ticks / 10_000_000) + Duration::from_nanos((ticks % 10_000_000) * 100)
}

/// Text collected from a target during one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOutput {
    /// Accumulated output
    pub text: String,
    /// The completion marker was observed
    pub completed: bool,
    /// Collection stopped because the run was cancelled
    pub cancelled: bool,
}

/// Outcome counts for a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total results
    pub total: usize,
    /// Passed
    pub passed: usize,
    /// Failed
    pub failed: usize,
    /// Skipped
    pub skipped: usize,
    /// Still pending
    pub pending: usize,
}

impl RunSummary {
    /// Count outcomes
    pub fn from_results(results: &[TestResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.outcome {
                TestOutcome::Passed => summary.passed += 1,
                TestOutcome::Failed => summary.failed += 1,
                TestOutcome::Skipped => summary.skipped += 1,
                TestOutcome::Pending => summary.pending += 1,
            }
        }
        summary
    }

    /// No failures and nothing left pending
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.pending == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} passed, {} failed, {} skipped, {} pending",
            self.total, self.passed, self.failed, self.skipped, self.pending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_is_pending() {
        let tests = vec![
            TestCase::new("A.B.One", "One", "a.pe"),
            TestCase::new("A.B.Two", "Two", "a.pe"),
        ];
        let results = build_scaffold(&tests);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == TestOutcome::Pending));
        assert_eq!(results[1].test_case.display_name, "Two");
    }

    #[test]
    fn test_class_qualifier() {
        let case = TestCase::new("Ns.Class.Method", "Method", "x.pe");
        assert_eq!(case.class_qualifier(), "Ns.Class");
        assert_eq!(TestCase::new("Bare", "Bare", "x.pe").class_qualifier(), "");
    }

    #[test]
    fn test_setup_trait() {
        let case = TestCase::new("A.Setup", "Setup", "x.pe").with_trait("Type", "Setup");
        assert!(case.is_setup());
        let other = TestCase::new("A.Run", "Run", "x.pe").with_trait("Type", "Cleanup");
        assert!(!other.is_setup());
    }

    #[test]
    fn test_ticks() {
        assert_eq!(ticks_to_duration(500), Duration::from_nanos(50_000));
        assert_eq!(ticks_to_duration(10_000_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(-3), Duration::ZERO);
    }

    #[test]
    fn test_summary() {
        let mut results = build_scaffold(&[
            TestCase::new("A.X", "X", "a.pe"),
            TestCase::new("A.Y", "Y", "a.pe"),
        ]);
        results[0].outcome = TestOutcome::Passed;
        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.pending, 1);
        assert!(!summary.is_success());
    }
}
