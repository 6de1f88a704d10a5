//! Result reports for the terminal

use crate::core::model::{MessageCategory, RunSummary, TestOutcome, TestResult};
use crate::core::sink::ResultSink;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One line per test plus a summary
    #[default]
    Text,
    /// A single JSON document
    Json,
}

#[derive(Serialize)]
struct JsonResult<'a> {
    name: &'a str,
    display_name: &'a str,
    source: String,
    outcome: TestOutcome,
    duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl<'a> JsonResult<'a> {
    fn new(result: &'a TestResult) -> Self {
        Self {
            name: &result.test_case.fully_qualified_name,
            display_name: &result.test_case.display_name,
            source: result.test_case.source.display().to_string(),
            outcome: result.outcome,
            duration_ms: result.duration.as_secs_f64() * 1000.0,
            error: result.error_message.as_deref(),
            stdout: joined(result, MessageCategory::StandardOut),
            stderr: joined(result, MessageCategory::StandardError),
        }
    }
}

fn joined(result: &TestResult, category: MessageCategory) -> Option<String> {
    let text: String = result
        .messages
        .iter()
        .filter(|m| m.category == category)
        .map(|m| m.text.as_str())
        .collect();
    (!text.is_empty()).then_some(text)
}

/// Render one result as a text line
pub fn format_text(result: &TestResult, verbose: bool) -> String {
    let mut line = format!(
        "{:<8} {} ({:.3} ms)",
        result.outcome.to_string(),
        result.test_case.fully_qualified_name,
        result.duration.as_secs_f64() * 1000.0
    );
    if let Some(error) = &result.error_message {
        line.push_str("\n         ");
        line.push_str(error);
    }
    if verbose {
        for message in &result.messages {
            for text in message.text.lines() {
                line.push_str("\n         | ");
                line.push_str(text);
            }
        }
    }
    line
}

/// Render every result as one JSON document
pub fn format_json(results: &[TestResult], summary: &RunSummary) -> serde_json::Result<String> {
    let results: Vec<JsonResult<'_>> = results.iter().map(JsonResult::new).collect();
    serde_json::to_string_pretty(&serde_json::json!({
        "results": results,
        "summary": summary,
    }))
}

/// Sink that prints results to a writer
pub struct Reporter<W: Write + Send> {
    format: OutputFormat,
    verbose: bool,
    out: Mutex<W>,
    buffered: Mutex<Vec<TestResult>>,
}

impl<W: Write + Send> Reporter<W> {
    /// Create a reporter
    pub fn new(out: W, format: OutputFormat, verbose: bool) -> Self {
        Self {
            format,
            verbose,
            out: Mutex::new(out),
            buffered: Mutex::new(Vec::new()),
        }
    }

    /// Give back the writer
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> ResultSink for Reporter<W> {
    fn record(&self, result: &TestResult) {
        match self.format {
            OutputFormat::Text => {
                let line = format_text(result, self.verbose);
                if let Err(e) = writeln!(self.out.lock(), "{line}") {
                    tracing::warn!(error = %e, "failed to write result");
                }
            }
            OutputFormat::Json => self.buffered.lock().push(result.clone()),
        }
    }

    fn finish(&self, summary: &RunSummary) {
        let rendered = match self.format {
            OutputFormat::Text => Ok(format!("\n{summary}")),
            OutputFormat::Json => format_json(&self.buffered.lock(), summary),
        };
        let written = match rendered {
            Ok(text) => writeln!(self.out.lock(), "{text}"),
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write summary");
        }
    }
}
