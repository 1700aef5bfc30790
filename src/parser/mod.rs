//! Streaming statement tokenizer for PostgreSQL plain-text dumps.
//!
//! [`StatementSplitter`] is a pure, line-fed state machine. [`StatementReader`]
//! (blocking) and [`AsyncStatementReader`] (tokio) feed it from a byte stream
//! one physical line at a time, so memory is bounded by the longest statement
//! rather than the file size.

mod classify;

pub use classify::{
    classify, normalize_table_name, strip_leading_comments, truncate_chars, Statement,
    StatementKind,
};

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::BufRead;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const SMALL_BUFFER_SIZE: usize = 64 * 1024;
pub const MEDIUM_BUFFER_SIZE: usize = 256 * 1024;

/// Inputs above this size are treated as large for buffering and reporting.
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// The line that terminates a COPY ... FROM stdin data block.
pub const COPY_TERMINATOR: &str = "\\.";

/// One unit produced by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpItem {
    /// A complete statement, verbatim.
    Statement(Statement),
    /// One raw data line of a COPY block, without its line terminator.
    CopyRow(String),
    /// The `\.` line that closes a COPY block.
    CopyEnd,
}

/// What to do with buffered text that has no terminator at end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Append `;` and emit the statement.
    #[default]
    Repair,
    /// Fail with [`PipelineError::TruncatedInput`].
    Error,
}

impl std::str::FromStr for TruncationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repair" => Ok(TruncationPolicy::Repair),
            "error" => Ok(TruncationPolicy::Error),
            _ => Err(format!(
                "Unknown truncation policy: {}. Valid options: repair, error",
                s
            )),
        }
    }
}

/// Describes a best-effort recovery made at end of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Truncation {
    /// A statement without terminator was repaired.
    Statement { offset: u64, preview: String },
    /// Input ended inside a COPY data block; the block was closed.
    CopyBlock { offset: u64 },
}

#[derive(Debug, Default, Clone)]
struct ScanState {
    in_single_quote: bool,
    in_double_quote: bool,
    in_block_comment: bool,
    escaped: bool,
    dollar_tag: Option<String>,
}

impl ScanState {
    fn is_clean(&self) -> bool {
        !self.in_single_quote
            && !self.in_double_quote
            && !self.in_block_comment
            && self.dollar_tag.is_none()
    }
}

/// Line-fed statement boundary detector.
///
/// Feed every physical line, terminator included, through [`push_line`],
/// drain [`pop`] after each line, and call [`finish`] once at end of input.
///
/// [`push_line`]: StatementSplitter::push_line
/// [`pop`]: StatementSplitter::pop
/// [`finish`]: StatementSplitter::finish
#[derive(Debug)]
pub struct StatementSplitter {
    buffer: String,
    state: ScanState,
    in_copy: bool,
    offset: u64,
    lines: u64,
    policy: TruncationPolicy,
    pending: VecDeque<DumpItem>,
}

impl StatementSplitter {
    pub fn new(policy: TruncationPolicy) -> Self {
        Self {
            buffer: String::with_capacity(32 * 1024),
            state: ScanState::default(),
            in_copy: false,
            offset: 0,
            lines: 0,
            policy,
            pending: VecDeque::new(),
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Physical lines consumed so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn in_copy(&self) -> bool {
        self.in_copy
    }

    /// Take the next ready item.
    pub fn pop(&mut self) -> Option<DumpItem> {
        self.pending.pop_front()
    }

    /// Consume one physical line (including its `\n` / `\r\n` if present).
    pub fn push_line(&mut self, line: &str) {
        self.offset += line.len() as u64;
        self.lines += 1;

        if self.in_copy {
            let row = line.trim_end_matches(['\n', '\r']);
            if row == COPY_TERMINATOR {
                self.in_copy = false;
                self.pending.push_back(DumpItem::CopyEnd);
            } else {
                self.pending.push_back(DumpItem::CopyRow(row.to_string()));
            }
            return;
        }

        let bytes = line.as_bytes();
        let line_end_offset = self.offset;
        let mut seg_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            let st = &mut self.state;

            if st.escaped {
                st.escaped = false;
                i += 1;
                continue;
            }

            if st.in_block_comment {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    st.in_block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }

            if let Some(tag) = &st.dollar_tag {
                if bytes[i..].starts_with(tag.as_bytes()) {
                    i += tag.len();
                    st.dollar_tag = None;
                } else {
                    i += 1;
                }
                continue;
            }

            if b == b'\\' {
                st.escaped = true;
                i += 1;
                continue;
            }

            if st.in_single_quote {
                if b == b'\'' {
                    st.in_single_quote = false;
                }
                i += 1;
                continue;
            }

            if st.in_double_quote {
                if b == b'"' {
                    st.in_double_quote = false;
                }
                i += 1;
                continue;
            }

            match b {
                b'\'' => st.in_single_quote = true,
                b'"' => st.in_double_quote = true,
                b'-' if bytes.get(i + 1) == Some(&b'-') => break,
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    st.in_block_comment = true;
                    i += 2;
                    continue;
                }
                b'$' => {
                    if let Some(tag) = dollar_tag_at(&line[i..]) {
                        i += tag.len();
                        st.dollar_tag = Some(tag.to_string());
                        continue;
                    }
                }
                b';' => {
                    self.buffer.push_str(&line[seg_start..=i]);
                    seg_start = i + 1;
                    let end = line_end_offset - (bytes.len() - seg_start) as u64;
                    let stmt = Statement::new(std::mem::take(&mut self.buffer), end);
                    let enters_copy = stmt.is_copy_from_stdin();
                    self.pending.push_back(DumpItem::Statement(stmt));
                    if enters_copy {
                        self.in_copy = true;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        self.buffer.push_str(&line[seg_start..]);
    }

    /// Flush at end of input.
    pub fn finish(&mut self) -> Result<Option<Truncation>> {
        if self.in_copy {
            self.in_copy = false;
            self.pending.push_back(DumpItem::CopyEnd);
            return Ok(Some(Truncation::CopyBlock {
                offset: self.offset,
            }));
        }

        let text = std::mem::take(&mut self.buffer);
        self.state = ScanState::default();
        if text.trim().is_empty() {
            return Ok(None);
        }

        let stmt = Statement::new(text, self.offset);
        if stmt.is_blank() {
            self.pending.push_back(DumpItem::Statement(stmt));
            return Ok(None);
        }

        let preview = stmt.preview(80);
        match self.policy {
            TruncationPolicy::Error => Err(PipelineError::TruncatedInput {
                offset: self.offset,
                preview,
            }),
            TruncationPolicy::Repair => {
                let mut text = stmt.into_text();
                let keep = text.trim_end().len();
                text.truncate(keep);
                if !text.ends_with(';') {
                    text.push(';');
                }
                text.push('\n');
                let stmt = Statement::new(text, self.offset).mark_repaired();
                self.pending.push_back(DumpItem::Statement(stmt));
                Ok(Some(Truncation::Statement {
                    offset: self.offset,
                    preview,
                }))
            }
        }
    }

    /// True when no quote, comment or dollar body is open.
    pub fn at_boundary(&self) -> bool {
        self.state.is_clean() && self.buffer.trim().is_empty()
    }
}

/// Match `$$` or `$tag$` at the start of `s`. Positional parameters such as
/// `$1` are not tags.
fn dollar_tag_at(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'$') {
        return None;
    }
    if bytes.get(1) == Some(&b'$') {
        return Some(&s[..2]);
    }
    let first = *bytes.get(1)?;
    if !(first.is_ascii_alphabetic() || first == b'_' || first >= 0x80) {
        return None;
    }
    for (i, &b) in bytes.iter().enumerate().skip(2) {
        if b == b'$' {
            return Some(&s[..=i]);
        }
        if !(b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80) {
            return None;
        }
    }
    None
}

/// Throttled byte-offset callback.
struct ProgressHook {
    every: u64,
    last: u64,
    callback: Box<dyn FnMut(u64) + Send>,
}

impl ProgressHook {
    fn report(&mut self, offset: u64, force: bool) {
        if force || offset.saturating_sub(self.last) >= self.every {
            self.last = offset;
            (self.callback)(offset);
        }
    }
}

/// Blocking reader producing [`DumpItem`]s from any [`BufRead`].
pub struct StatementReader<R: BufRead> {
    reader: R,
    splitter: StatementSplitter,
    line: Vec<u8>,
    finished: bool,
    truncation: Option<Truncation>,
    progress: Option<ProgressHook>,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(reader: R, policy: TruncationPolicy) -> Self {
        Self {
            reader,
            splitter: StatementSplitter::new(policy),
            line: Vec::with_capacity(8 * 1024),
            finished: false,
            truncation: None,
            progress: None,
        }
    }

    /// Report the byte offset every `every` bytes and once at end of input.
    pub fn with_progress<F>(mut self, every: u64, callback: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.progress = Some(ProgressHook {
            every: every.max(1),
            last: 0,
            callback: Box::new(callback),
        });
        self
    }

    /// Recovery made at end of input, if any.
    pub fn truncation(&self) -> Option<&Truncation> {
        self.truncation.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.splitter.offset()
    }

    pub fn lines(&self) -> u64 {
        self.splitter.lines()
    }

    fn fill(&mut self) -> Result<()> {
        while self.splitter.pending.is_empty() && !self.finished {
            self.line.clear();
            let n = self.reader.read_until(b'\n', &mut self.line)?;
            if n == 0 {
                self.finished = true;
                self.truncation = self.splitter.finish()?;
                if let Some(p) = self.progress.as_mut() {
                    p.report(self.splitter.offset(), true);
                }
                break;
            }
            let line = String::from_utf8_lossy(&self.line);
            self.splitter.push_line(&line);
            if let Some(p) = self.progress.as_mut() {
                p.report(self.splitter.offset(), false);
            }
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = Result<DumpItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.finished = true;
            return Some(Err(e));
        }
        self.splitter.pop().map(Ok)
    }
}

/// Async reader producing [`DumpItem`]s from a tokio [`AsyncBufRead`].
///
/// The only await point is the line read, so parsing itself never yields
/// mid-statement.
pub struct AsyncStatementReader<R: AsyncBufRead + Unpin> {
    reader: R,
    splitter: StatementSplitter,
    line: Vec<u8>,
    finished: bool,
    truncation: Option<Truncation>,
    progress: Option<ProgressHook>,
}

impl<R: AsyncBufRead + Unpin> AsyncStatementReader<R> {
    pub fn new(reader: R, policy: TruncationPolicy) -> Self {
        Self {
            reader,
            splitter: StatementSplitter::new(policy),
            line: Vec::with_capacity(8 * 1024),
            finished: false,
            truncation: None,
            progress: None,
        }
    }

    /// Report the byte offset every `every` bytes and once at end of input.
    pub fn with_progress<F>(mut self, every: u64, callback: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.progress = Some(ProgressHook {
            every: every.max(1),
            last: 0,
            callback: Box::new(callback),
        });
        self
    }

    pub fn truncation(&self) -> Option<&Truncation> {
        self.truncation.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.splitter.offset()
    }

    pub fn lines(&self) -> u64 {
        self.splitter.lines()
    }

    pub async fn next_item(&mut self) -> Result<Option<DumpItem>> {
        while self.splitter.pending.is_empty() && !self.finished {
            self.line.clear();
            let n = self.reader.read_until(b'\n', &mut self.line).await?;
            if n == 0 {
                self.finished = true;
                self.truncation = self.splitter.finish()?;
                if let Some(p) = self.progress.as_mut() {
                    p.report(self.splitter.offset(), true);
                }
                break;
            }
            let line = String::from_utf8_lossy(&self.line);
            self.splitter.push_line(&line);
            if let Some(p) = self.progress.as_mut() {
                p.report(self.splitter.offset(), false);
            }
        }
        Ok(self.splitter.pop())
    }
}

/// Split an in-memory script into statements, ignoring COPY data.
pub fn split_statements(sql: &str) -> Result<Vec<Statement>> {
    StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair)
        .filter_map(|item| match item {
            Ok(DumpItem::Statement(stmt)) => Some(Ok(stmt)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect()
}

pub fn determine_buffer_size(file_size: u64) -> usize {
    if file_size > 1024 * 1024 * 1024 {
        MEDIUM_BUFFER_SIZE
    } else {
        SMALL_BUFFER_SIZE
    }
}

/// Byte interval between progress callbacks.
pub fn determine_report_interval(file_size: u64) -> u64 {
    if file_size > LARGE_FILE_THRESHOLD {
        2 * 1024 * 1024
    } else {
        512 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn statements(sql: &str) -> Vec<String> {
        split_statements(sql)
            .unwrap()
            .into_iter()
            .map(|s| s.sql().to_string())
            .collect()
    }

    #[test]
    fn test_read_statement_basic() {
        let stmts = statements("CREATE TABLE t1 (id INT); INSERT INTO t1 VALUES (1);");
        assert_eq!(stmts, vec!["CREATE TABLE t1 (id INT);", "INSERT INTO t1 VALUES (1);"]);
    }

    #[test]
    fn test_read_statement_with_strings() {
        let stmts = statements("INSERT INTO t1 VALUES ('hello; world');");
        assert_eq!(stmts, vec!["INSERT INTO t1 VALUES ('hello; world');"]);
    }

    #[test]
    fn test_read_statement_with_escaped_quotes() {
        let stmts = statements("INSERT INTO t1 VALUES ('it\\'s a test');\nSELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "INSERT INTO t1 VALUES ('it\\'s a test');");
    }

    #[test]
    fn test_copy_block_items() {
        let sql = "COPY widgets (id, name) FROM stdin;\n1\tAlpha\n2\t\\N\n\\.\nSELECT 1;\n";
        let items: Vec<DumpItem> = StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(items.len(), 5);
        assert!(matches!(&items[0], DumpItem::Statement(s) if s.kind() == StatementKind::Copy));
        assert_eq!(items[1], DumpItem::CopyRow("1\tAlpha".to_string()));
        assert_eq!(items[2], DumpItem::CopyRow("2\t\\N".to_string()));
        assert_eq!(items[3], DumpItem::CopyEnd);
        assert!(matches!(&items[4], DumpItem::Statement(s) if s.kind() == StatementKind::Select));
    }

    #[test]
    fn test_copy_rows_ignore_quote_state() {
        // An unbalanced quote inside COPY data must not leak into the next statement.
        let sql = "COPY t (a) FROM stdin;\nit's\n\\.\nINSERT INTO t VALUES ('x');\n";
        let stmts = statements(sql);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "INSERT INTO t VALUES ('x');");
    }

    #[test]
    fn test_offsets_are_statement_ends() {
        let sql = "SELECT 1;\nSELECT 22;\n";
        let stmts = split_statements(sql).unwrap();
        assert_eq!(stmts[0].offset(), 9);
        assert_eq!(stmts[1].offset(), 20);
    }

    #[test]
    fn test_progress_callback_is_throttled() {
        let mut sql = String::new();
        for i in 0..100 {
            sql.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reader = StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair)
            .with_progress(1000, move |pos| sink.lock().unwrap().push(pos));
        let count = reader.count();
        assert_eq!(count, 100);

        let seen = seen.lock().unwrap();
        assert!(seen.len() < 10, "callback should be throttled, got {}", seen.len());
        assert_eq!(*seen.last().unwrap(), sql.len() as u64);
    }

    #[test]
    fn test_dollar_tag_detection() {
        assert_eq!(dollar_tag_at("$$ body"), Some("$$"));
        assert_eq!(dollar_tag_at("$fn$ body"), Some("$fn$"));
        assert_eq!(dollar_tag_at("$1, $2"), None);
        assert_eq!(dollar_tag_at("$abc"), None);
    }

    #[tokio::test]
    async fn test_async_reader_matches_blocking_reader() {
        let sql = "SET x = 1;\nCOPY t (a) FROM stdin;\n1\n\\.\nINSERT INTO t VALUES (2);\n";
        let blocking: Vec<DumpItem> = StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair)
            .collect::<Result<_>>()
            .unwrap();

        let mut reader = AsyncStatementReader::new(sql.as_bytes(), TruncationPolicy::Repair);
        let mut items = Vec::new();
        while let Some(item) = reader.next_item().await.unwrap() {
            items.push(item);
        }
        assert_eq!(items, blocking);
    }

    #[test]
    fn test_line_count_includes_copy_rows() {
        let sql = "SELECT 1;\nCOPY t (a) FROM stdin;\n1\n2\n\\.\nSELECT 2;";
        let mut reader = StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair);
        let items = reader.by_ref().count();
        assert_eq!(items, 6);
        assert_eq!(reader.lines(), 6);
    }

    #[test]
    fn test_report_interval() {
        assert_eq!(determine_report_interval(1024), 512 * 1024);
        assert_eq!(determine_report_interval(LARGE_FILE_THRESHOLD + 1), 2 * 1024 * 1024);
    }
}
