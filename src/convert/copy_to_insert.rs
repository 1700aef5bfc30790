//! Convert PostgreSQL COPY FROM stdin blocks to batched INSERT statements.
//!
//! Handles:
//! - Tab-separated value parsing
//! - NULL handling (\N → NULL)
//! - Escape sequence decoding (\t, \n, \\, octal, hex)
//! - Literal shaping: booleans and numbers unquoted, everything else quoted
//! - Batched INSERT generation, flushed as soon as a batch is full

use super::transform::RowTransform;
use crate::parser::{normalize_table_name, strip_leading_comments};
use once_cell::sync::Lazy;
use regex::Regex;

/// Default maximum rows per generated INSERT statement
pub const DEFAULT_INSERT_BATCH_WIDTH: usize = 500;

/// Result of parsing a COPY header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyHeader {
    /// Table reference as written in the dump (e.g. `public.widgets`)
    pub table_ref: String,
    /// Lowercased table name without schema qualifier
    pub table: String,
    /// Column list as written (may be empty if not specified)
    pub columns: Vec<String>,
    /// Lowercased, unquoted column names, parallel to `columns`
    pub column_names: Vec<String>,
}

static RE_COPY: Lazy<Regex> = Lazy::new(|| {
    // COPY [ONLY] [schema.]table [(columns)] FROM stdin
    Regex::new(
        r#"(?is)^COPY\s+(?:ONLY\s+)?((?:"(?:[^"]|"")+"|[\w$]+)(?:\s*\.\s*(?:"(?:[^"]|"")+"|[\w$]+))*)\s*(?:\(([^)]*)\))?\s+FROM\s+stdin\b"#,
    )
    .unwrap()
});

/// Parse a COPY header to extract table and columns.
/// Input: "COPY schema.table (col1, col2) FROM stdin;"
pub fn parse_copy_header(stmt: &str) -> Option<CopyHeader> {
    let stmt = strip_leading_comments(stmt);
    let caps = RE_COPY.captures(stmt)?;

    let table_ref = caps.get(1)?.as_str().to_string();
    let table = normalize_table_name(&table_ref)?;

    let columns: Vec<String> = caps
        .get(2)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let column_names = columns
        .iter()
        .map(|c| normalize_table_name(c).unwrap_or_else(|| c.to_lowercase()))
        .collect();

    Some(CopyHeader {
        table_ref,
        table,
        columns,
        column_names,
    })
}

/// A decoded COPY cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Null,
    Value(String),
}

impl Cell {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Null => None,
            Cell::Value(s) => Some(s),
        }
    }
}

/// Parse a single tab-separated COPY row
pub fn parse_row(line: &str) -> Vec<Cell> {
    let mut cells = Vec::new();
    let mut start = 0;
    for pos in memchr::memchr_iter(b'\t', line.as_bytes()) {
        cells.push(parse_value(&line[start..pos]));
        start = pos + 1;
    }
    cells.push(parse_value(&line[start..]));
    cells
}

fn parse_value(value: &str) -> Cell {
    if value == "\\N" {
        return Cell::Null;
    }
    Cell::Value(decode_escapes(value.as_bytes()))
}

/// Decode PostgreSQL COPY text-format escape sequences
pub fn decode_escapes(value: &[u8]) -> String {
    if memchr::memchr(b'\\', value).is_none() {
        return String::from_utf8_lossy(value).into_owned();
    }

    let mut out = Vec::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i] != b'\\' || i + 1 >= value.len() {
            out.push(value[i]);
            i += 1;
            continue;
        }

        let next = value[i + 1];
        match next {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'v' => out.push(0x0B),
            b'\\' => out.push(b'\\'),
            b'0'..=b'7' => {
                // up to three octal digits
                let mut octal: u32 = 0;
                let mut consumed = 0;
                while consumed < 3 {
                    match value.get(i + 1 + consumed) {
                        Some(&d) if (b'0'..=b'7').contains(&d) => {
                            octal = octal * 8 + u32::from(d - b'0');
                            consumed += 1;
                        }
                        _ => break,
                    }
                }
                out.push((octal & 0xFF) as u8);
                i += 1 + consumed;
                continue;
            }
            b'x' => {
                // up to two hex digits
                let digits: Vec<u8> = value[i + 2..]
                    .iter()
                    .take(2)
                    .take_while(|b| b.is_ascii_hexdigit())
                    .copied()
                    .collect();
                if digits.is_empty() {
                    out.push(b'x');
                    i += 2;
                    continue;
                }
                let hex = std::str::from_utf8(&digits).unwrap_or("0");
                out.push(u8::from_str_radix(hex, 16).unwrap_or(0));
                i += 2 + digits.len();
                continue;
            }
            // Any other escaped character stands for itself
            other => out.push(other),
        }
        i += 2;
    }

    String::from_utf8_lossy(&out).into_owned()
}

static NUMERIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").unwrap());

/// Format a cell as an SQL literal
pub fn format_cell(cell: &Cell) -> String {
    let value = match cell {
        Cell::Null => return "NULL".to_string(),
        Cell::Value(v) => v,
    };

    if value.eq_ignore_ascii_case("t") || value.eq_ignore_ascii_case("true") {
        return "true".to_string();
    }
    if value.eq_ignore_ascii_case("f") || value.eq_ignore_ascii_case("false") {
        return "false".to_string();
    }
    if NUMERIC_RE.is_match(value) {
        return value.clone();
    }

    let quoted = value.replace('\'', "''");
    if value.contains('\\') {
        // Escape-string syntax keeps doubled backslashes meaningful
        // regardless of standard_conforming_strings.
        format!("E'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{}'", quoted)
    }
}

/// Transient state of one COPY block being rewritten.
///
/// Holds at most one batch of formatted tuples; each full batch is returned
/// from [`CopyBlock::push_row`] as a finished INSERT statement.
#[derive(Debug)]
pub struct CopyBlock {
    header: CopyHeader,
    width: usize,
    prefix: String,
    pending: Vec<String>,
    rows: u64,
    inserts: u64,
    column_mismatches: u64,
}

impl CopyBlock {
    pub fn new(header: CopyHeader, width: usize) -> Self {
        let prefix = if header.columns.is_empty() {
            format!("INSERT INTO {} VALUES\n", header.table_ref)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES\n",
                header.table_ref,
                header.columns.join(", ")
            )
        };
        let width = width.max(1);
        Self {
            header,
            width,
            prefix,
            pending: Vec::with_capacity(width.min(1024)),
            rows: 0,
            inserts: 0,
            column_mismatches: 0,
        }
    }

    pub fn header(&self) -> &CopyHeader {
        &self.header
    }

    /// Rows converted so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// INSERT statements produced so far
    pub fn inserts(&self) -> u64 {
        self.inserts
    }

    /// Rows whose cell count differed from the header's column list
    pub fn column_mismatches(&self) -> u64 {
        self.column_mismatches
    }

    /// Add one raw data line; returns an INSERT when a batch fills up.
    pub fn push_row(&mut self, line: &str, transform: Option<&dyn RowTransform>) -> Option<String> {
        let mut cells = parse_row(line);
        if !self.header.columns.is_empty() && cells.len() != self.header.columns.len() {
            self.column_mismatches += 1;
        }
        if let Some(t) = transform {
            t.transform(&self.header.table, &self.header.column_names, &mut cells);
        }

        let mut tuple = String::with_capacity(line.len() + 2 * cells.len() + 2);
        tuple.push('(');
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                tuple.push_str(", ");
            }
            tuple.push_str(&format_cell(cell));
        }
        tuple.push(')');

        self.pending.push(tuple);
        self.rows += 1;

        if self.pending.len() >= self.width {
            self.flush()
        } else {
            None
        }
    }

    /// Emit whatever is left in the current batch.
    pub fn finish(&mut self) -> Option<String> {
        self.flush()
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let body_len: usize = self.pending.iter().map(|t| t.len() + 2).sum();
        let mut insert = String::with_capacity(self.prefix.len() + body_len + 1);
        insert.push_str(&self.prefix);
        insert.push_str(&self.pending.join(",\n"));
        insert.push(';');
        self.pending.clear();
        self.inserts += 1;
        Some(insert)
    }
}

/// Convert a complete COPY data block (rows without terminator) in one call
pub fn copy_to_inserts(header: &CopyHeader, rows: &[&str], width: usize) -> Vec<String> {
    let mut block = CopyBlock::new(header.clone(), width);
    let mut inserts: Vec<String> = rows
        .iter()
        .filter_map(|row| block.push_row(row, None))
        .collect();
    inserts.extend(block.finish());
    inserts
}
