use std::collections::BTreeMap;
use std::str::FromStr;

use tracebench_model::{OperationStat, TraceSummary};

use super::tokenize::{classify, fields_by_count, Layout, LineKind, RowFields, Token};
use super::{ParseError, SourceFormat};

/// Reads the per-operation summary table printed by an execution-trace tool, for example the
/// output of `strace -c`.
pub struct TraceSummaryParser;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceParseError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The total row disagrees with the rows above it, the report was truncated or concatenated.
    #[error("Trace summary total reports {reported} calls but its rows sum to {summed}")]
    Consistency { reported: u64, summed: u64 },
}

impl TraceSummaryParser {
    /// Parse a summary table into per-operation statistics.
    ///
    /// Rows are keyed by operation name and a repeated name replaces the earlier row. The row
    /// named `total` becomes [TraceSummary::total] and must agree with the sum of the other rows.
    pub fn parse(text: &str) -> Result<TraceSummary, TraceParseError> {
        let mut header: Option<Vec<Token<'_>>> = None;
        let mut layout: Option<Layout> = None;
        let mut saw_table = false;
        let mut operations = BTreeMap::new();
        let mut total = None;

        for (index, line) in text.lines().enumerate() {
            let line_number = index + 1;
            match classify(line) {
                LineKind::Blank | LineKind::Diagnostic => {}
                LineKind::Header(tokens) => {
                    header = Some(tokens);
                    layout = None;
                    saw_table = true;
                }
                LineKind::Separator(spans) => {
                    layout = Layout::new(header.as_deref(), &spans);
                    if layout.is_none() {
                        log::debug!(
                            "Separator on line {line_number} does not define a usable layout"
                        );
                    }
                    saw_table = true;
                }
                LineKind::Row(tokens) => {
                    let fields = layout
                        .as_ref()
                        .and_then(|layout| layout.assign(&tokens))
                        .or_else(|| fields_by_count(&tokens))
                        .ok_or_else(|| {
                            error(format!("unexpected number of fields ({})", tokens.len()))
                                .at_line(line_number, line)
                        })?;
                    let stat =
                        operation_stat(fields).map_err(|e| e.at_line(line_number, line))?;

                    if stat.is_total() {
                        total = Some(stat);
                    } else if let Some(previous) = operations.insert(stat.name.clone(), stat) {
                        log::debug!(
                            "Operation '{}' listed again on line {line_number}, keeping the later row",
                            previous.name
                        );
                    }
                }
            }
        }

        if !saw_table && operations.is_empty() && total.is_none() {
            return Err(error("no summary table found").into());
        }

        let summary = TraceSummary::new(operations, total);
        let summed = summary
            .calls_excluding_total()
            .ok_or_else(|| error("sum of calls does not fit in 64 bits"))?;
        if let Some(total) = summary.total() {
            if summed != total.calls {
                return Err(TraceParseError::Consistency {
                    reported: total.calls,
                    summed,
                });
            }
        }

        Ok(summary)
    }
}

fn error(reason: impl Into<String>) -> ParseError {
    ParseError::new(SourceFormat::TraceSummary, reason)
}

fn operation_stat(fields: RowFields<'_>) -> Result<OperationStat, ParseError> {
    let name = fields
        .name
        .ok_or_else(|| error("missing operation name"))?
        .to_string();
    let time_percent: f64 = required(fields.time_percent, "% time")?;
    let total_time_seconds: f64 = required(fields.seconds, "seconds")?;
    let usec_per_call = fields
        .usecs_per_call
        .map(|value| number::<f64>(value, "usecs/call"))
        .transpose()?;
    let calls: u64 = required(fields.calls, "calls")?;
    let errors = fields
        .errors
        .map(|value| number::<u64>(value, "errors"))
        .transpose()?
        .unwrap_or(0);

    if !(0.0..=100.0).contains(&time_percent) {
        return Err(error(format!("% time {time_percent} is outside 0..=100")));
    }
    if errors > calls {
        return Err(error(format!(
            "{errors} errors reported for only {calls} calls"
        )));
    }

    Ok(OperationStat {
        name,
        calls,
        errors,
        time_percent,
        total_time_seconds,
        usec_per_call,
    })
}

fn required<T: FromStr>(value: Option<&str>, column: &str) -> Result<T, ParseError> {
    let value = value.ok_or_else(|| error(format!("missing {column} column")))?;
    number(value, column)
}

fn number<T: FromStr>(value: &str, column: &str) -> Result<T, ParseError> {
    value
        .parse::<T>()
        .map_err(|_| error(format!("invalid {column} value '{value}'")))
}
