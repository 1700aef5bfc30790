//! Post-pass verification scan.
//!
//! Re-reads rewritten output line by line and looks for any executable
//! operation that still targets a protected table. The scan shares no state
//! with the tokenizer: it is deliberately naive (every guarded operation on a
//! non-comment line, wherever it starts) so a bug in the single-pass filter
//! cannot hide itself. Text inside string literals and function bodies is
//! scanned too.

use super::ProtectionRules;
use crate::error::{PipelineError, Result};
use crate::parser::{normalize_table_name, truncate_chars};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error};

/// Maximum offending lines carried in a violation error
pub const MAX_EXAMPLES: usize = 5;

static GUARDED_OP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)\b(?:
            INSERT\s+INTO
          | UPDATE(?:\s+ONLY)?
          | DELETE\s+FROM(?:\s+ONLY)?
          | TRUNCATE(?:\s+TABLE)?(?:\s+ONLY)?
          | ALTER\s+(?:TABLE|SEQUENCE)(?:\s+IF\s+EXISTS)?(?:\s+ONLY)?
          | DROP\s+(?:TABLE|SEQUENCE|VIEW)(?:\s+IF\s+EXISTS)?
          | CREATE\s+(?:UNLOGGED\s+)?(?:TABLE|SEQUENCE)(?:\s+IF\s+NOT\s+EXISTS)?
          | CREATE\s+(?:UNIQUE\s+)?INDEX\s+.*?\bON(?:\s+ONLY)?
          | COPY
        )\s+",
    )
    .unwrap()
});

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub line: u64,
    pub table: String,
    pub text: String,
}

/// Summary of a clean scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub lines_scanned: u64,
}

/// Check one line; `None` for comments and unguarded lines.
fn scan_line(line: &str, rules: &ProtectionRules) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with("--") {
        return None;
    }
    GUARDED_OP_RE.find_iter(trimmed).find_map(|m| {
        let table = normalize_table_name(&trimmed[m.end()..])?;
        rules.match_table(&table).map(|_| table)
    })
}

/// Scan in-memory text, returning every offending line.
pub fn scan_text(text: &str, rules: &ProtectionRules) -> Vec<Finding> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            scan_line(line, rules).map(|table| Finding {
                line: i as u64 + 1,
                table,
                text: truncate_chars(line.trim(), 120),
            })
        })
        .collect()
}

/// Scan a rewritten file. Any finding is a [`PipelineError::ProtectionViolation`].
pub async fn verify_file(path: &Path, rules: &ProtectionRules) -> Result<VerifyReport> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut line_no = 0u64;
    let mut count = 0usize;
    let mut examples = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        line_no += 1;
        let line = String::from_utf8_lossy(&buf);
        if let Some(table) = scan_line(&line, rules) {
            count += 1;
            if examples.len() < MAX_EXAMPLES {
                examples.push(format!(
                    "line {} ({}): {}",
                    line_no,
                    table,
                    truncate_chars(line.trim(), 120)
                ));
            }
        }
    }

    if count > 0 {
        error!(
            path = %path.display(),
            count,
            "verification scan found unfiltered operations against protected tables"
        );
        return Err(PipelineError::ProtectionViolation {
            path: path.to_path_buf(),
            count,
            examples,
        });
    }

    debug!(path = %path.display(), lines = line_no, "verification scan clean");
    Ok(VerifyReport {
        lines_scanned: line_no,
    })
}
