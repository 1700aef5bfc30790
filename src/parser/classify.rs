//! Statement classification: kind and target table.
//!
//! Table extraction is a keyword heuristic, not a SQL parser. It understands
//! the shapes pg_dump actually emits (`ONLY`, `IF [NOT] EXISTS`, schema
//! qualifiers, quoted identifiers) and nothing more. Everything that needs a
//! target table goes through [`classify`] so the limits live in one place.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a SQL statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Truncate,
    Alter,
    Create,
    Drop,
    Copy,
    Select,
    Other,
}

impl StatementKind {
    pub const ALL: [StatementKind; 10] = [
        StatementKind::Insert,
        StatementKind::Update,
        StatementKind::Delete,
        StatementKind::Truncate,
        StatementKind::Alter,
        StatementKind::Create,
        StatementKind::Drop,
        StatementKind::Copy,
        StatementKind::Select,
        StatementKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Truncate => "TRUNCATE",
            StatementKind::Alter => "ALTER",
            StatementKind::Create => "CREATE",
            StatementKind::Drop => "DROP",
            StatementKind::Copy => "COPY",
            StatementKind::Select => "SELECT",
            StatementKind::Other => "OTHER",
        }
    }

    /// Statements that change table contents.
    pub fn is_data_modifying(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::Truncate
                | StatementKind::Copy
        )
    }

    /// Statements that change the schema.
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            StatementKind::Alter | StatementKind::Create | StatementKind::Drop
        )
    }

    /// Kinds the protected-table filter applies to.
    pub fn is_guarded(&self) -> bool {
        self.is_data_modifying() || self.is_schema()
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static COPY_FROM_STDIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFROM\s+stdin\b").unwrap());

/// A single complete SQL statement as produced by the tokenizer.
///
/// `text` is the verbatim span from the input, including leading comments,
/// whitespace and the terminating `;`. Concatenating the texts of all
/// statements of a stream reproduces the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    text: String,
    kind: StatementKind,
    target_table: Option<String>,
    offset: u64,
    repaired: bool,
}

impl Statement {
    /// Classify `text`. `offset` is the byte offset just past the statement.
    pub fn new(text: String, offset: u64) -> Self {
        let (kind, target_table) = classify(&text);
        Self {
            text,
            kind,
            target_table,
            offset,
            repaired: false,
        }
    }

    pub(crate) fn mark_repaired(mut self) -> Self {
        self.repaired = true;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Lowercased, unquoted table name without schema qualifier.
    pub fn target_table(&self) -> Option<&str> {
        self.target_table.as_deref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True when the tokenizer appended a missing terminator at end of input.
    pub fn is_repaired(&self) -> bool {
        self.repaired
    }

    /// Statement body with leading comments and surrounding whitespace removed.
    pub fn sql(&self) -> &str {
        strip_leading_comments(&self.text).trim_end()
    }

    /// Nothing but comments, whitespace and terminators.
    pub fn is_blank(&self) -> bool {
        self.sql().trim_end_matches(';').trim().is_empty()
    }

    pub fn is_copy_from_stdin(&self) -> bool {
        self.kind == StatementKind::Copy && COPY_FROM_STDIN_RE.is_match(self.sql())
    }

    /// `SET ...`, `RESET ...` and `SELECT pg_catalog.set_config(...)`.
    pub fn is_session_setting(&self) -> bool {
        let mut cursor = Cursor::new(self.sql());
        if cursor.keyword("SET") || cursor.keyword("RESET") {
            return true;
        }
        let mut cursor = Cursor::new(self.sql());
        cursor.keyword("SELECT")
            && cursor
                .rest
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("pg_catalog.set_config")
    }

    /// First line of the statement body, capped at `max` characters.
    pub fn preview(&self, max: usize) -> String {
        let first = self.sql().lines().next().unwrap_or("").trim();
        truncate_chars(first, max)
    }
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Strip leading `--` and `/* */` comments and whitespace.
pub fn strip_leading_comments(stmt: &str) -> &str {
    let mut result = stmt.trim_start();
    loop {
        if result.starts_with("--") {
            match result.find('\n') {
                Some(pos) => {
                    result = result[pos + 1..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        if result.starts_with("/*") {
            match result.find("*/") {
                Some(pos) => {
                    result = result[pos + 2..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        break;
    }
    result
}

/// Derive the kind and target table of a statement.
///
/// A leading `WITH` list is skipped and the main statement classified. When
/// the main statement only reads, the first data-modifying CTE body decides
/// instead, so `WITH d AS (DELETE FROM t RETURNING *) SELECT ...` is a
/// `DELETE` on `t`.
pub fn classify(stmt: &str) -> (StatementKind, Option<String>) {
    let mut c = Cursor::new(strip_leading_comments(stmt));
    if c.keyword("WITH") {
        return classify_with(&mut c).unwrap_or((StatementKind::Other, None));
    }
    classify_main(c)
}

fn classify_with(c: &mut Cursor<'_>) -> Option<(StatementKind, Option<String>)> {
    c.keyword("RECURSIVE");
    let mut nested_write = None;
    loop {
        c.table_name()?;
        c.skip_ws();
        if c.rest.starts_with('(') {
            c.parenthesized()?;
        }
        if !c.keyword("AS") {
            return None;
        }
        c.keyword("NOT");
        c.keyword("MATERIALIZED");
        let body = c.parenthesized()?;
        if nested_write.is_none() {
            let inner = classify(body);
            if inner.0.is_data_modifying() {
                nested_write = Some(inner);
            }
        }
        c.skip_ws();
        match c.rest.strip_prefix(',') {
            Some(rest) => c.rest = rest,
            None => break,
        }
    }

    let main = classify_main(Cursor::new(c.rest));
    match nested_write {
        Some(write) if !main.0.is_data_modifying() => Some(write),
        _ => Some(main),
    }
}

fn classify_main(mut c: Cursor<'_>) -> (StatementKind, Option<String>) {
    if c.keyword("INSERT") {
        if c.keyword("INTO") {
            return (StatementKind::Insert, c.table_name());
        }
        return (StatementKind::Insert, None);
    }
    if c.keyword("UPDATE") {
        c.keyword("ONLY");
        return (StatementKind::Update, c.table_name());
    }
    if c.keyword("DELETE") {
        if c.keyword("FROM") {
            c.keyword("ONLY");
            return (StatementKind::Delete, c.table_name());
        }
        return (StatementKind::Delete, None);
    }
    if c.keyword("TRUNCATE") {
        c.keyword("TABLE");
        c.keyword("ONLY");
        return (StatementKind::Truncate, c.table_name());
    }
    if c.keyword("COPY") {
        return (StatementKind::Copy, c.table_name());
    }
    if c.keyword("ALTER") {
        if c.keyword("TABLE") || c.keyword("SEQUENCE") {
            c.if_exists();
            c.keyword("ONLY");
            return (StatementKind::Alter, c.table_name());
        }
        return (StatementKind::Alter, None);
    }
    if c.keyword("DROP") {
        if c.keyword("TABLE") || c.keyword("SEQUENCE") || c.keyword("VIEW") {
            c.if_exists();
            return (StatementKind::Drop, c.table_name());
        }
        return (StatementKind::Drop, None);
    }
    if c.keyword("CREATE") {
        return (StatementKind::Create, classify_create(&mut c));
    }
    if c.keyword("SELECT") {
        return (StatementKind::Select, None);
    }

    (StatementKind::Other, None)
}

fn classify_create(c: &mut Cursor<'_>) -> Option<String> {
    if c.keyword("OR") {
        c.keyword("REPLACE");
    }
    let _ = c.keyword("GLOBAL") || c.keyword("LOCAL");
    let _ = c.keyword("TEMPORARY") || c.keyword("TEMP") || c.keyword("UNLOGGED");

    if c.keyword("TABLE") || c.keyword("SEQUENCE") {
        c.if_not_exists();
        return c.table_name();
    }
    if c.keyword("MATERIALIZED") {
        c.keyword("VIEW");
        c.if_not_exists();
        return c.table_name();
    }
    if c.keyword("VIEW") {
        return c.table_name();
    }

    c.keyword("UNIQUE");
    if c.keyword("INDEX") {
        c.keyword("CONCURRENTLY");
        c.if_not_exists();
        if !c.keyword("ON") {
            // index name
            c.table_name()?;
            if !c.keyword("ON") {
                return None;
            }
        }
        c.keyword("ONLY");
        return c.table_name();
    }

    None
}

/// Normalize a possibly schema-qualified, possibly quoted table reference to
/// its lowercased bare name: `"Public"."Users"` -> `users`.
pub fn normalize_table_name(raw: &str) -> Option<String> {
    Cursor::new(raw).table_name()
}

/// Tiny forward-only cursor over statement text.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Consume `kw` (case-insensitive) if it is the next whole word.
    fn keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let bytes = self.rest.as_bytes();
        if bytes.len() < kw.len() || !bytes[..kw.len()].eq_ignore_ascii_case(kw.as_bytes()) {
            return false;
        }
        if let Some(&next) = bytes.get(kw.len()) {
            if is_ident_byte(next) {
                return false;
            }
        }
        self.rest = &self.rest[kw.len()..];
        true
    }

    fn if_exists(&mut self) {
        let saved = self.rest;
        if !(self.keyword("IF") && self.keyword("EXISTS")) {
            self.rest = saved;
        }
    }

    fn if_not_exists(&mut self) {
        let saved = self.rest;
        if !(self.keyword("IF") && self.keyword("NOT") && self.keyword("EXISTS")) {
            self.rest = saved;
        }
    }

    /// Read one identifier segment, unquoting `"..."` (with `""` escapes).
    fn segment(&mut self) -> Option<String> {
        let bytes = self.rest.as_bytes();
        if bytes.first() == Some(&b'"') {
            let mut name = String::new();
            let mut chars = self.rest[1..].char_indices();
            while let Some((i, ch)) = chars.next() {
                if ch == '"' {
                    if self.rest[1 + i + 1..].starts_with('"') {
                        name.push('"');
                        chars.next();
                        continue;
                    }
                    self.rest = &self.rest[1 + i + 1..];
                    return Some(name);
                }
                name.push(ch);
            }
            return None;
        }

        let end = bytes
            .iter()
            .position(|&b| !is_ident_byte(b))
            .unwrap_or(bytes.len());
        if end == 0 {
            return None;
        }
        let name = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Some(name)
    }

    /// Consume a balanced `( ... )` group and return its inner text. Quoted
    /// strings and identifiers may contain parentheses.
    fn parenthesized(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest;
        if !rest.starts_with('(') {
            return None;
        }
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        for (i, &b) in rest.as_bytes().iter().enumerate() {
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            self.rest = &rest[i + 1..];
                            return Some(&rest[1..i]);
                        }
                    }
                    _ => {}
                },
            }
        }
        None
    }

    /// Read a dotted name and return its last segment, lowercased.
    fn table_name(&mut self) -> Option<String> {
        self.skip_ws();
        let mut last = self.segment()?;
        while self.rest.starts_with('.') {
            self.rest = &self.rest[1..];
            last = self.segment()?;
        }
        Some(last.to_lowercase())
    }
}

#[inline]
fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(sql: &str) -> Option<String> {
        classify(sql).1
    }

    #[test]
    fn test_classify_insert() {
        let (kind, name) = classify("INSERT INTO posts VALUES (1, 'test');");
        assert_eq!(kind, StatementKind::Insert);
        assert_eq!(name.as_deref(), Some("posts"));
    }

    #[test]
    fn test_classify_schema_qualified() {
        assert_eq!(
            table("INSERT INTO public.users (id) VALUES (1);").as_deref(),
            Some("users")
        );
    }

    #[test]
    fn test_classify_quoted_identifiers() {
        assert_eq!(
            table(r#"INSERT INTO "public"."Users" VALUES (1);"#).as_deref(),
            Some("users")
        );
        assert_eq!(
            table(r#"COPY "odd""name" (id) FROM stdin;"#).as_deref(),
            Some("odd\"name")
        );
        assert_eq!(
            table(r#"UPDATE "my.table" SET x = 1;"#).as_deref(),
            Some("my.table")
        );
    }

    #[test]
    fn test_classify_mixed_case_keywords() {
        let (kind, name) = classify("insert Into Public.Widgets values (1);");
        assert_eq!(kind, StatementKind::Insert);
        assert_eq!(name.as_deref(), Some("widgets"));
    }

    #[test]
    fn test_classify_alter_table_only() {
        let (kind, name) =
            classify("ALTER TABLE ONLY public.orders ADD CONSTRAINT orders_pkey PRIMARY KEY (id);");
        assert_eq!(kind, StatementKind::Alter);
        assert_eq!(name.as_deref(), Some("orders"));
    }

    #[test]
    fn test_classify_drop_if_exists() {
        let (kind, name) = classify("DROP TABLE IF EXISTS temp_data;");
        assert_eq!(kind, StatementKind::Drop);
        assert_eq!(name.as_deref(), Some("temp_data"));
    }

    #[test]
    fn test_classify_create_variants() {
        assert_eq!(
            table("CREATE TABLE IF NOT EXISTS public.t1 (id int);").as_deref(),
            Some("t1")
        );
        assert_eq!(
            table("CREATE UNLOGGED TABLE etl_stage (id int);").as_deref(),
            Some("etl_stage")
        );
        assert_eq!(
            table("CREATE UNIQUE INDEX idx_a ON ONLY public.accounts USING btree (a);").as_deref(),
            Some("accounts")
        );
        assert_eq!(
            table("CREATE INDEX ON widgets (name);").as_deref(),
            Some("widgets")
        );
        assert_eq!(table("CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$;"), None);
    }

    #[test]
    fn test_classify_truncate_and_delete() {
        assert_eq!(
            classify("TRUNCATE TABLE ONLY public.jobs;"),
            (StatementKind::Truncate, Some("jobs".to_string()))
        );
        assert_eq!(
            classify("DELETE FROM ONLY logs WHERE id = 1;"),
            (StatementKind::Delete, Some("logs".to_string()))
        );
    }

    #[test]
    fn test_classify_with_prefix() {
        assert_eq!(
            classify("WITH x AS (SELECT 1) INSERT INTO databasechangelog SELECT * FROM x;"),
            (StatementKind::Insert, Some("databasechangelog".to_string()))
        );
        assert_eq!(
            classify(
                "WITH RECURSIVE a (n) AS (SELECT ')(' UNION SELECT n FROM a),\n\
                 b AS NOT MATERIALIZED (SELECT (1)) UPDATE ONLY public.jobs SET x = 1;"
            ),
            (StatementKind::Update, Some("jobs".to_string()))
        );
        assert_eq!(
            classify("WITH d AS (DELETE FROM etl_batch RETURNING *) SELECT count(*) FROM d;"),
            (StatementKind::Delete, Some("etl_batch".to_string()))
        );
        assert_eq!(
            classify("WITH x AS (SELECT 1) SELECT * FROM x;"),
            (StatementKind::Select, None)
        );
        assert_eq!(classify("WITH broken AS SELECT 1;").0, StatementKind::Other);
    }

    #[test]
    fn test_classify_leading_comments() {
        let sql = "--\n-- Data for Name: widgets\n--\n/* block */ COPY public.widgets (id) FROM stdin;";
        assert_eq!(
            classify(sql),
            (StatementKind::Copy, Some("widgets".to_string()))
        );
    }

    #[test]
    fn test_classify_other_and_select() {
        assert_eq!(classify("SET client_encoding = 'UTF8';").0, StatementKind::Other);
        assert_eq!(
            classify("SELECT pg_catalog.setval('public.a_id_seq', 4, true);").0,
            StatementKind::Select
        );
        assert_eq!(classify("").0, StatementKind::Other);
    }

    #[test]
    fn test_keyword_must_be_whole_word() {
        assert_eq!(classify("INSERTED INTO x;").0, StatementKind::Other);
        assert_eq!(classify("UPDATES x;").0, StatementKind::Other);
    }

    #[test]
    fn test_statement_helpers() {
        let stmt = Statement::new("-- c\nSET statement_timeout = 0;".to_string(), 10);
        assert!(stmt.is_session_setting());
        assert_eq!(stmt.sql(), "SET statement_timeout = 0;");

        let stmt = Statement::new(
            "SELECT pg_catalog.set_config('search_path', '', false);".to_string(),
            0,
        );
        assert!(stmt.is_session_setting());

        let blank = Statement::new("\n-- just a comment\n;".to_string(), 0);
        assert!(blank.is_blank());

        let copy = Statement::new("COPY public.w (id) FROM stdin;".to_string(), 0);
        assert!(copy.is_copy_from_stdin());
        let copy_file = Statement::new("COPY w TO '/tmp/x';".to_string(), 0);
        assert!(!copy_file.is_copy_from_stdin());
    }

    #[test]
    fn test_normalize_table_name() {
        assert_eq!(normalize_table_name("Public.ETL_Batch").as_deref(), Some("etl_batch"));
        assert_eq!(normalize_table_name("\"x\"").as_deref(), Some("x"));
        assert_eq!(normalize_table_name("").as_deref(), None);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("ééé", 2), "éé...");
    }
}
