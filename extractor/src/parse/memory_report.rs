use tracebench_model::MemoryUsage;

use super::{ParseError, SourceFormat};

const MAX_RSS_LABEL: &str = "maximum resident set size";

/// Reads the peak resident memory from a resource-usage report
///
/// Understands the GNU `time -v` line `Maximum resident set size (kbytes): 120380`, and the BSD
/// `time -l` line `123269120  maximum resident set size` which is already in bytes.
pub struct MemoryReportParser;

impl MemoryReportParser {
    pub fn parse(text: &str) -> Result<MemoryUsage, ParseError> {
        for (index, line) in text.lines().enumerate() {
            let lower = line.to_ascii_lowercase();
            let Some(label_at) = lower.find(MAX_RSS_LABEL) else {
                continue;
            };

            return max_resident(line, &lower, label_at).map_err(|e| e.at_line(index + 1, line));
        }

        Err(error("no maximum resident set size line found"))
    }
}

fn max_resident(line: &str, lower: &str, label_at: usize) -> Result<MemoryUsage, ParseError> {
    if lower.contains("(kbytes)") {
        let value = line.rsplit(':').next().map(str::trim).unwrap_or_default();
        let kilobytes = parse_count(value)?;
        MemoryUsage::from_kilobytes(kilobytes)
            .ok_or_else(|| error(format!("{kilobytes} kbytes overflows a byte count")))
    } else {
        let max_resident_bytes = parse_count(line[..label_at].trim())?;
        Ok(MemoryUsage { max_resident_bytes })
    }
}

fn parse_count(value: &str) -> Result<u64, ParseError> {
    value
        .parse::<u64>()
        .map_err(|_| error(format!("invalid maximum resident set size '{value}'")))
}

fn error(reason: impl Into<String>) -> ParseError {
    ParseError::new(SourceFormat::MemoryReport, reason)
}
