use std::fmt;

mod exec_time;
mod memory_report;
mod tokenize;
mod trace_summary;

pub use exec_time::ExecTimeParser;
pub use memory_report::MemoryReportParser;
pub use trace_summary::{TraceParseError, TraceSummaryParser};

/// The text formats understood by the parsers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    TraceSummary,
    MemoryReport,
    ExecTime,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::TraceSummary => write!(f, "trace summary"),
            SourceFormat::MemoryReport => write!(f, "memory report"),
            SourceFormat::ExecTime => write!(f, "exec time report"),
        }
    }
}

/// A report that could not be turned into statistics
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse {source_format}: {reason}{}", location(.line_number, .line))]
pub struct ParseError {
    pub source_format: SourceFormat,
    pub reason: String,
    /// One-based number of the offending line, if the problem is tied to one
    pub line_number: Option<usize>,
    pub line: Option<String>,
}

impl ParseError {
    pub(crate) fn new(source_format: SourceFormat, reason: impl Into<String>) -> Self {
        Self {
            source_format,
            reason: reason.into(),
            line_number: None,
            line: None,
        }
    }

    pub(crate) fn at_line(mut self, line_number: usize, line: &str) -> Self {
        self.line_number = Some(line_number);
        self.line = Some(line.to_string());
        self
    }
}

fn location(line_number: &Option<usize>, line: &Option<String>) -> String {
    match (line_number, line) {
        (Some(number), Some(line)) => format!(" on line {number}: '{}'", line.trim_end()),
        (Some(number), None) => format!(" on line {number}"),
        _ => String::new(),
    }
}
