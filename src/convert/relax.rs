//! Loosen schema statements so a dump can be replayed into an existing database.
//!
//! - database-level commands are dropped
//! - `ADD CONSTRAINT` and `CREATE UNIQUE INDEX` are commented out
//! - `CREATE TABLE|INDEX|SEQUENCE` gain `IF NOT EXISTS`
//! - the source database name is replaced by the target name outside data statements

use crate::parser::{strip_leading_comments, Statement, StatementKind};
use once_cell::sync::Lazy;
use regex::Regex;

static DATABASE_COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:CREATE|DROP|ALTER)\s+DATABASE|COMMENT\s+ON\s+DATABASE)\b").unwrap()
});

static ADD_CONSTRAINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^ALTER\s+TABLE\b.*\bADD\s+CONSTRAINT\b").unwrap());

static UNIQUE_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^CREATE\s+UNIQUE\s+INDEX\b").unwrap());

static CREATE_OBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^CREATE\s+(?:UNLOGGED\s+)?(?:TABLE|SEQUENCE|INDEX)\s+").unwrap()
});

static IF_NOT_EXISTS_OR_ON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:IF\s+NOT\s+EXISTS|ON)\b").unwrap());

/// Marker prefix for commented-out constraint statements
pub const SKIPPED_CONSTRAINT_PREFIX: &str = "-- SKIPPED CONSTRAINT: ";

/// Outcome of relaxing one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relaxed {
    /// Emit the statement unchanged
    Keep,
    /// Emit this text instead
    Rewrite(String),
    /// Database-level command, dropped
    DatabaseCommand,
    /// Constraint commented out; emit the comment block
    ConstraintSkipped(String),
}

/// Schema relaxation rules for one run
#[derive(Debug, Clone, Default)]
pub struct SchemaRelaxer {
    rename: Option<(String, String)>,
}

impl SchemaRelaxer {
    pub fn new(source_database: Option<&str>, target_database: Option<&str>) -> Self {
        let rename = match (source_database, target_database) {
            (Some(s), Some(t)) if !s.is_empty() && s != t => Some((s.to_string(), t.to_string())),
            _ => None,
        };
        Self { rename }
    }

    pub fn relax(&self, stmt: &Statement) -> Relaxed {
        let body = stmt.sql();

        if DATABASE_COMMAND_RE.is_match(body) {
            return Relaxed::DatabaseCommand;
        }

        if stmt.kind() == StatementKind::Alter && ADD_CONSTRAINT_RE.is_match(body)
            || stmt.kind() == StatementKind::Create && UNIQUE_INDEX_RE.is_match(body)
        {
            return Relaxed::ConstraintSkipped(comment_out(body));
        }

        let mut text: Option<String> = None;

        if stmt.kind() == StatementKind::Create {
            if let Some(m) = CREATE_OBJECT_RE.find(body) {
                if !IF_NOT_EXISTS_OR_ON_RE.is_match(&body[m.end()..]) {
                    let full = stmt.text();
                    let lead = full.len() - strip_leading_comments(full).len();
                    let at = lead + m.end();
                    let mut rewritten = String::with_capacity(full.len() + 14);
                    rewritten.push_str(&full[..at]);
                    rewritten.push_str("IF NOT EXISTS ");
                    rewritten.push_str(&full[at..]);
                    text = Some(rewritten);
                }
            }
        }

        if let Some((source, target)) = &self.rename {
            if !stmt.kind().is_data_modifying() {
                let current = text.as_deref().unwrap_or(stmt.text());
                if let Some(renamed) = replace_whole_name(current, source, target) {
                    text = Some(renamed);
                }
            }
        }

        match text {
            Some(t) => Relaxed::Rewrite(t),
            None => Relaxed::Keep,
        }
    }
}

/// Characters that continue a database name on either side of a match.
fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '-'
}

/// Replace occurrences of `from` that stand alone as a name, so `app-test`
/// leaves `app-test-archive` and `my_app-test` untouched. `None` when nothing matched.
fn replace_whole_name(text: &str, from: &str, to: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut replaced = false;
    for (at, _) in text.match_indices(from) {
        if at < last {
            continue;
        }
        let end = at + from.len();
        let before = text[..at].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(is_name_char) || after.is_some_and(is_name_char) {
            continue;
        }
        out.push_str(&text[last..at]);
        out.push_str(to);
        last = end;
        replaced = true;
    }
    if !replaced {
        return None;
    }
    out.push_str(&text[last..]);
    Some(out)
}

/// Prefix every line of `body` so it becomes inert.
fn comment_out(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 32);
    for (i, line) in body.lines().enumerate() {
        if i == 0 {
            out.push_str(SKIPPED_CONSTRAINT_PREFIX);
        } else {
            out.push_str("-- ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Remove psql meta-command lines (`\connect db`, `\restrict key`) from the
/// start of a statement. Returns `None` when nothing executable remains.
pub fn strip_meta_commands(stmt: Statement) -> Option<Statement> {
    let body = stmt.sql();
    if !body.starts_with('\\') {
        return Some(stmt);
    }

    let mut rest = body;
    while rest.starts_with('\\') {
        rest = match rest.find('\n') {
            Some(pos) => rest[pos + 1..].trim_start(),
            None => "",
        };
    }
    if rest.trim_end_matches(';').trim().is_empty() {
        return None;
    }
    Some(Statement::new(format!("\n{}", rest), stmt.offset()))
}
