//! Parse warnings collected while rewriting a dump.
//!
//! Warnings never stop a run; they are logged when raised and reported
//! again in the end-of-run summary.

use tracing::warn;

/// Warning types that can occur during rewriting
#[derive(Debug, Clone, PartialEq)]
pub enum ParseWarning {
    /// COPY header could not be parsed into table and columns; block passed through
    UnparseableCopyHeader { statement_preview: String },
    /// Input ended inside a statement; a terminator was appended
    TruncatedStatement { offset: u64, statement_preview: String },
    /// Input ended inside a COPY block; the block was closed
    TruncatedCopyBlock { offset: u64 },
    /// COPY rows whose cell count differs from the header's column list
    ColumnCountMismatch { table: String, rows: u64 },
    /// Data line seen outside any COPY block
    StrayCopyData { line_preview: String },
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseWarning::UnparseableCopyHeader { statement_preview } => {
                write!(
                    f,
                    "Unparseable COPY header, block passed through unchanged ({})",
                    statement_preview
                )
            }
            ParseWarning::TruncatedStatement {
                offset,
                statement_preview,
            } => {
                write!(
                    f,
                    "Input ended inside a statement at byte {}; terminator appended ({})",
                    offset, statement_preview
                )
            }
            ParseWarning::TruncatedCopyBlock { offset } => {
                write!(f, "Input ended inside a COPY block at byte {}", offset)
            }
            ParseWarning::ColumnCountMismatch { table, rows } => {
                write!(
                    f,
                    "{} COPY row(s) for table '{}' do not match the column list",
                    rows, table
                )
            }
            ParseWarning::StrayCopyData { line_preview } => {
                write!(f, "Data line outside a COPY block ({})", line_preview)
            }
        }
    }
}

/// Collects warnings during rewriting
#[derive(Debug)]
pub struct WarningCollector {
    warnings: Vec<ParseWarning>,
    max_warnings: usize,
    total: usize,
}

impl Default for WarningCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::with_limit(100)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            warnings: Vec::new(),
            max_warnings: limit,
            total: 0,
        }
    }

    /// Log and record a warning
    pub fn add(&mut self, warning: ParseWarning) {
        warn!("{}", warning);
        self.total += 1;
        if self.warnings.len() < self.max_warnings {
            self.warnings.push(warning);
        }
    }

    /// Recorded warnings (at most the collector's limit)
    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn has_warnings(&self) -> bool {
        self.total > 0
    }

    /// Total warnings raised, including ones past the limit
    pub fn count(&self) -> usize {
        self.total
    }

    /// Warning messages, with a marker when some were dropped
    pub fn messages(&self) -> Vec<String> {
        let mut out: Vec<String> = self.warnings.iter().map(|w| w.to_string()).collect();
        if self.total > self.warnings.len() {
            out.push(format!(
                "... ({} additional warnings truncated)",
                self.total - self.warnings.len()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_limit_keeps_total() {
        let mut c = WarningCollector::with_limit(2);
        for i in 0..5 {
            c.add(ParseWarning::TruncatedCopyBlock { offset: i });
        }
        assert_eq!(c.warnings().len(), 2);
        assert_eq!(c.count(), 5);
        let messages = c.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[2].contains("3 additional"));
    }

    #[test]
    fn test_display() {
        let w = ParseWarning::ColumnCountMismatch {
            table: "widgets".into(),
            rows: 2,
        };
        assert_eq!(
            w.to_string(),
            "2 COPY row(s) for table 'widgets' do not match the column list"
        );
    }
}
