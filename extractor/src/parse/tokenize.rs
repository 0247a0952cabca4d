//! Line grammar for whitespace-aligned tables as printed by trace tools.
//!
//! Every line is one of
//!   - blank
//!   - a diagnostic from the tool itself, such as `strace: Process 42 attached`
//!   - a header, naming the columns, starting with `%` and including `calls`
//!   - a separator, made of runs of `-` whose extent defines the columns
//!   - a row
//!
//! Columns are positional. A separator following a header yields a [Layout] which maps every
//! token of a row to the column it sits under, so a blank cell is recognised as blank instead of
//! shifting the remaining fields.

/// Prefixes of lines that the tool prints about itself rather than about the traced program.
const DIAGNOSTIC_PREFIXES: &[&str] = &["strace:", "System call usage summary"];

/// A run of non-whitespace characters and the character columns it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub text: &'a str,
    pub start: usize,
    /// Exclusive
    pub end: usize,
}

impl Token<'_> {
    fn overlap(&self, span: &Span) -> usize {
        self.end.min(span.end).saturating_sub(self.start.max(span.start))
    }

    fn distance(&self, span: &Span) -> usize {
        if self.end <= span.start {
            span.start - self.end
        } else {
            self.start.saturating_sub(span.end)
        }
    }
}

/// Character columns covered by one separator dash run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    /// Exclusive
    pub end: usize,
}

#[derive(Debug, PartialEq)]
pub(crate) enum LineKind<'a> {
    Blank,
    Diagnostic,
    Header(Vec<Token<'a>>),
    Separator(Vec<Span>),
    Row(Vec<Token<'a>>),
}

/// Split a line on whitespace, keeping the character position of each token.
pub(crate) fn tokens(line: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut column = 0;

    for (byte_index, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some((byte_start, start)) = current.take() {
                tokens.push(Token {
                    text: &line[byte_start..byte_index],
                    start,
                    end: column,
                });
            }
        } else if current.is_none() {
            current = Some((byte_index, column));
        }
        column += 1;
    }
    if let Some((byte_start, start)) = current {
        tokens.push(Token {
            text: &line[byte_start..],
            start,
            end: column,
        });
    }

    tokens
}

pub(crate) fn classify(line: &str) -> LineKind<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineKind::Blank;
    }
    if DIAGNOSTIC_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return LineKind::Diagnostic;
    }
    if trimmed.starts_with('%') {
        let labels = tokens(line);
        if labels
            .iter()
            .any(|label| label.text.eq_ignore_ascii_case("calls"))
        {
            return LineKind::Header(labels);
        }
        return LineKind::Diagnostic;
    }
    if trimmed.chars().all(|c| c == '-' || c.is_whitespace()) {
        return LineKind::Separator(
            tokens(line)
                .into_iter()
                .map(|token| Span {
                    start: token.start,
                    end: token.end,
                })
                .collect(),
        );
    }

    LineKind::Row(tokens(line))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Column {
    TimePercent,
    Seconds,
    UsecsPerCall,
    Calls,
    Errors,
    Name,
    /// A column this parser does not use, for example per-call maximums
    Other,
}

impl Column {
    fn from_label(label: &str) -> Self {
        let label = label.to_ascii_lowercase();
        if label.starts_with('%') {
            Column::TimePercent
        } else if label == "seconds" {
            Column::Seconds
        } else if label.starts_with("usecs") {
            Column::UsecsPerCall
        } else if label == "calls" {
            Column::Calls
        } else if label == "errors" {
            Column::Errors
        } else if label == "syscall" || label == "name" {
            Column::Name
        } else {
            Column::Other
        }
    }
}

/// The classic column order, used when a separator appears without a header.
const DEFAULT_COLUMNS: [Column; 6] = [
    Column::TimePercent,
    Column::Seconds,
    Column::UsecsPerCall,
    Column::Calls,
    Column::Errors,
    Column::Name,
];

/// Column positions of one table, derived from its header and separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    columns: Vec<(Column, Span)>,
}

/// The cells of one row, by meaning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RowFields<'a> {
    pub time_percent: Option<&'a str>,
    pub seconds: Option<&'a str>,
    pub usecs_per_call: Option<&'a str>,
    pub calls: Option<&'a str>,
    pub errors: Option<&'a str>,
    pub name: Option<&'a str>,
}

impl Layout {
    /// Label each separator span with the header tokens above it.
    ///
    /// Returns [None] if the table shape cannot be determined.
    pub(crate) fn new(header: Option<&[Token<'_>]>, spans: &[Span]) -> Option<Self> {
        let columns = match header {
            Some(header) => spans
                .iter()
                .map(|span| {
                    let label = header
                        .iter()
                        .filter(|token| token.overlap(span) > 0)
                        .map(|token| token.text)
                        .collect::<Vec<_>>()
                        .join(" ");
                    (Column::from_label(&label), *span)
                })
                .collect::<Vec<_>>(),
            None if spans.len() == DEFAULT_COLUMNS.len() => DEFAULT_COLUMNS
                .iter()
                .copied()
                .zip(spans.iter().copied())
                .collect(),
            None => return None,
        };

        let has = |wanted: Column| columns.iter().any(|(column, _)| *column == wanted);
        if has(Column::Calls) && has(Column::Name) {
            Some(Self { columns })
        } else {
            None
        }
    }

    /// Assign every token of a row to a column.
    ///
    /// Returns [None] if two tokens land in the same column, which happens when a wide value
    /// pushes the row out of alignment. Callers should then fall back to [fields_by_count].
    pub(crate) fn assign<'a>(&self, row: &[Token<'a>]) -> Option<RowFields<'a>> {
        let mut fields = RowFields::default();
        for token in row {
            let (column, _) = self.columns.iter().max_by(|(_, a), (_, b)| {
                token
                    .overlap(a)
                    .cmp(&token.overlap(b))
                    .then_with(|| token.distance(b).cmp(&token.distance(a)))
            })?;

            let slot = match column {
                Column::TimePercent => &mut fields.time_percent,
                Column::Seconds => &mut fields.seconds,
                Column::UsecsPerCall => &mut fields.usecs_per_call,
                Column::Calls => &mut fields.calls,
                Column::Errors => &mut fields.errors,
                Column::Name => &mut fields.name,
                Column::Other => continue,
            };
            if slot.replace(token.text).is_some() {
                return None;
            }
        }

        Some(fields)
    }
}

/// Interpret a row by its number of fields alone.
///
/// 6 fields are a complete row. 5 fields are a row with no errors, except for the total row
/// which some tool versions print without the per-call column instead. 4 fields carry neither.
pub(crate) fn fields_by_count<'a>(row: &[Token<'a>]) -> Option<RowFields<'a>> {
    let text = row.iter().map(|token| token.text).collect::<Vec<_>>();
    let fields = match text[..] {
        [pct, secs, usecs, calls, errors, name] => RowFields {
            time_percent: Some(pct),
            seconds: Some(secs),
            usecs_per_call: Some(usecs),
            calls: Some(calls),
            errors: Some(errors),
            name: Some(name),
        },
        [pct, secs, calls, errors, name] if name == tracebench_model::TOTAL_KEY => RowFields {
            time_percent: Some(pct),
            seconds: Some(secs),
            usecs_per_call: None,
            calls: Some(calls),
            errors: Some(errors),
            name: Some(name),
        },
        [pct, secs, usecs, calls, name] => RowFields {
            time_percent: Some(pct),
            seconds: Some(secs),
            usecs_per_call: Some(usecs),
            calls: Some(calls),
            errors: None,
            name: Some(name),
        },
        [pct, secs, calls, name] => RowFields {
            time_percent: Some(pct),
            seconds: Some(secs),
            usecs_per_call: None,
            calls: Some(calls),
            errors: None,
            name: Some(name),
        },
        _ => return None,
    };

    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "% time     seconds  usecs/call     calls    errors syscall";
    const SEPARATOR: &str = "------ ----------- ----------- --------- --------- ----------------";

    fn layout() -> Layout {
        let header = tokens(HEADER);
        let LineKind::Separator(spans) = classify(SEPARATOR) else {
            panic!("separator not recognised");
        };
        Layout::new(Some(&header), &spans).expect("layout")
    }

    #[test]
    fn tokens_keep_positions() {
        let line = "  0.58    0.000064";
        assert_eq!(
            vec![
                Token {
                    text: "0.58",
                    start: 2,
                    end: 6
                },
                Token {
                    text: "0.000064",
                    start: 10,
                    end: 18
                },
            ],
            tokens(line)
        );
    }

    #[test]
    fn classifies_lines() {
        assert_eq!(LineKind::Blank, classify("   \t"));
        assert_eq!(LineKind::Diagnostic, classify("strace: Process 4242 attached"));
        assert!(matches!(classify(HEADER), LineKind::Header(_)));
        assert!(matches!(classify(SEPARATOR), LineKind::Separator(spans) if spans.len() == 6));
        assert!(matches!(
            classify("  0.58    0.000064          16         4         2 mkdir"),
            LineKind::Row(tokens) if tokens.len() == 6
        ));
    }

    #[test]
    fn percent_line_without_calls_column_is_not_a_header() {
        assert_eq!(LineKind::Diagnostic, classify("% cumulative self time"));
        assert!(matches!(
            classify("% TIME SECONDS USECS/CALL CALLS ERRORS SYSCALL"),
            LineKind::Header(_)
        ));
    }

    #[test]
    fn header_labels_become_columns() {
        let columns = layout()
            .columns
            .iter()
            .map(|(column, _)| *column)
            .collect::<Vec<_>>();
        assert_eq!(DEFAULT_COLUMNS.to_vec(), columns);
    }

    #[test]
    fn blank_error_cell_is_recognised_by_position() {
        let row = tokens(" 53.17    0.005880          98        60           munmap");
        let fields = layout().assign(&row).unwrap();

        assert_eq!(Some("60"), fields.calls);
        assert_eq!(Some("98"), fields.usecs_per_call);
        assert_eq!(None, fields.errors);
        assert_eq!(Some("munmap"), fields.name);
    }

    #[test]
    fn blank_usecs_cell_on_total_row_is_recognised_by_position() {
        let row = tokens("100.00    0.011058                   704        16 total");
        let fields = layout().assign(&row).unwrap();

        assert_eq!(None, fields.usecs_per_call);
        assert_eq!(Some("704"), fields.calls);
        assert_eq!(Some("16"), fields.errors);
        assert_eq!(Some("total"), fields.name);
    }

    #[test]
    fn misaligned_row_is_rejected_by_layout() {
        let row = tokens("1.0 2.0 3 4 5 read");
        assert_eq!(None, layout().assign(&row));
    }

    #[test]
    fn separator_without_header_uses_default_columns() {
        let LineKind::Separator(spans) = classify(SEPARATOR) else {
            panic!("separator not recognised");
        };
        assert!(Layout::new(None, &spans).is_some());
        assert!(Layout::new(None, &spans[..3]).is_none());
    }

    #[test]
    fn field_count_fallback() {
        let legacy_total = fields_by_count(&tokens("100.00 0.011058 704 16 total")).unwrap();
        assert_eq!(None, legacy_total.usecs_per_call);
        assert_eq!(Some("16"), legacy_total.errors);

        let no_errors = fields_by_count(&tokens("53.17 0.005880 98 60 munmap")).unwrap();
        assert_eq!(Some("98"), no_errors.usecs_per_call);
        assert_eq!(None, no_errors.errors);

        let bare = fields_by_count(&tokens("53.17 0.005880 60 munmap")).unwrap();
        assert_eq!(Some("60"), bare.calls);

        assert_eq!(None, fields_by_count(&tokens("munmap")));
    }
}
