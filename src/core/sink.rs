//! Result delivery to the host

use super::model::{RunSummary, TestResult};
use parking_lot::Mutex;

/// Receives finished results
pub trait ResultSink: Send + Sync {
    /// Record one result
    fn record(&self, result: &TestResult);

    /// Called once after the last result
    fn finish(&self, _summary: &RunSummary) {}
}

/// Hand every result to `sink` and return the summary
pub fn publish(results: &[TestResult], sink: &dyn ResultSink) -> RunSummary {
    for result in results {
        sink.record(result);
    }
    let summary = RunSummary::from_results(results);
    sink.finish(&summary);
    summary
}

/// Sink that keeps results in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    results: Mutex<Vec<TestResult>>,
    summary: Mutex<Option<RunSummary>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Results recorded so far
    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().clone()
    }

    /// Summary, once finished
    pub fn summary(&self) -> Option<RunSummary> {
        *self.summary.lock()
    }
}

impl ResultSink for CollectingSink {
    fn record(&self, result: &TestResult) {
        self.results.lock().push(result.clone());
    }

    fn finish(&self, summary: &RunSummary) {
        *self.summary.lock() = Some(*summary);
    }
}
