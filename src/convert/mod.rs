//! Dump rewriting: one item of tokenizer output in, rewritten text out.
//!
//! Supports:
//! - COPY FROM stdin → batched INSERT conversion
//! - Protected-table exclusion with audit comments
//! - Schema relaxation (database commands, constraints, IF NOT EXISTS)
//! - Per-row transform hook for COPY data
//! - Session prelude/postlude that disables triggers during the load

mod copy_to_insert;
mod relax;
mod transform;
mod warnings;

pub use copy_to_insert::{
    copy_to_inserts, decode_escapes, format_cell, parse_copy_header, parse_row, Cell, CopyBlock,
    CopyHeader, DEFAULT_INSERT_BATCH_WIDTH,
};
pub use relax::{strip_meta_commands, Relaxed, SchemaRelaxer, SKIPPED_CONSTRAINT_PREFIX};
pub use transform::{ColumnScrubber, RowTransform};
pub use warnings::{ParseWarning, WarningCollector};

use crate::parser::{truncate_chars, DumpItem, Statement, StatementKind, Truncation};
use crate::protect::{audit_comment, ProtectionCategory, ProtectionRules};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SESSION_PRELUDE: &str = "SET session_replication_role = replica;\n";
pub const SESSION_POSTLUDE: &str = "\nSET session_replication_role = DEFAULT;\n";

/// Rewriting options for one dump
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub insert_batch_width: usize,
    pub relax_schema: bool,
    pub disable_triggers: bool,
    pub source_database: Option<String>,
    pub target_database: Option<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            insert_batch_width: DEFAULT_INSERT_BATCH_WIDTH,
            relax_schema: true,
            disable_triggers: true,
            source_database: None,
            target_database: None,
        }
    }
}

/// Statistics from one rewrite pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformStats {
    pub lines: u64,
    pub bytes: u64,
    pub statements: u64,
    pub original_inserts: u64,
    pub copy_blocks: u64,
    pub copy_rows: u64,
    pub inserts_generated: u64,
    pub protected_statements: BTreeMap<ProtectionCategory, u64>,
    pub protected_copy_rows: u64,
    pub database_commands_skipped: u64,
    pub constraints_skipped: u64,
    pub meta_commands_skipped: u64,
    pub repaired_statements: u64,
    pub warnings: Vec<String>,
    pub warning_count: usize,
}

impl TransformStats {
    pub fn protected(&self, category: ProtectionCategory) -> u64 {
        self.protected_statements.get(&category).copied().unwrap_or(0)
    }

    pub fn protected_total(&self) -> u64 {
        self.protected_statements.values().sum()
    }
}

enum CopyState {
    Idle,
    Active(CopyBlock),
    /// Protected block: rows are dropped
    Suppressed,
    /// Header could not be parsed: rows are copied verbatim
    Passthrough,
}

/// Rewrites tokenizer items into output text.
///
/// Each call appends zero or more text chunks to `out`; concatenating every
/// chunk, in order, gives the rewritten file.
pub struct DumpRewriter {
    options: RewriteOptions,
    rules: Arc<ProtectionRules>,
    relaxer: Option<SchemaRelaxer>,
    transform: Option<Arc<dyn RowTransform>>,
    copy: CopyState,
    stats: TransformStats,
    warnings: WarningCollector,
}

impl DumpRewriter {
    pub fn new(options: RewriteOptions, rules: Arc<ProtectionRules>) -> Self {
        let relaxer = options.relax_schema.then(|| {
            SchemaRelaxer::new(
                options.source_database.as_deref(),
                options.target_database.as_deref(),
            )
        });
        Self {
            options,
            rules,
            relaxer,
            transform: None,
            copy: CopyState::Idle,
            stats: TransformStats::default(),
            warnings: WarningCollector::new(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn RowTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Text to write before any item
    pub fn prelude(&self) -> Option<&'static str> {
        self.options.disable_triggers.then_some(SESSION_PRELUDE)
    }

    pub fn stats(&self) -> &TransformStats {
        &self.stats
    }

    pub fn process(&mut self, item: DumpItem, out: &mut Vec<String>) {
        match item {
            DumpItem::Statement(stmt) => self.process_statement(stmt, out),
            DumpItem::CopyRow(row) => self.process_copy_row(&row, out),
            DumpItem::CopyEnd => self.process_copy_end(out),
        }
    }

    /// Record an end-of-input recovery made by the tokenizer
    pub fn note_truncation(&mut self, truncation: &Truncation) {
        match truncation {
            Truncation::Statement { offset, preview } => {
                self.warnings.add(ParseWarning::TruncatedStatement {
                    offset: *offset,
                    statement_preview: preview.clone(),
                });
            }
            Truncation::CopyBlock { offset } => {
                self.warnings.add(ParseWarning::TruncatedCopyBlock { offset: *offset });
            }
        }
    }

    /// Flush the postlude and return the statistics.
    pub fn finish(mut self, lines: u64, bytes: u64, out: &mut Vec<String>) -> TransformStats {
        if !matches!(self.copy, CopyState::Idle) {
            self.process_copy_end(out);
        }
        if self.options.disable_triggers {
            out.push(SESSION_POSTLUDE.to_string());
        }
        self.stats.lines = lines;
        self.stats.bytes = bytes;
        self.stats.warning_count = self.warnings.count();
        self.stats.warnings = self.warnings.messages();
        self.stats
    }

    fn process_statement(&mut self, stmt: Statement, out: &mut Vec<String>) {
        if stmt.is_blank() {
            out.push(stmt.into_text());
            return;
        }
        if stmt.is_repaired() {
            self.stats.repaired_statements += 1;
        }

        let stmt = match strip_meta_commands(stmt) {
            Some(s) => s,
            None => {
                self.stats.meta_commands_skipped += 1;
                return;
            }
        };
        self.stats.statements += 1;

        if let Some(hit) = self.rules.check(&stmt) {
            warn!(
                table = %hit.table,
                category = %hit.category,
                kind = %stmt.kind(),
                "excluding operation on protected table"
            );
            *self.stats.protected_statements.entry(hit.category).or_insert(0) += 1;
            out.push(format!("\n{}\n", audit_comment(&hit, &stmt)));
            if stmt.is_copy_from_stdin() {
                self.copy = CopyState::Suppressed;
            }
            return;
        }

        if stmt.is_copy_from_stdin() {
            match parse_copy_header(stmt.text()) {
                Some(header) => {
                    debug!(table = %header.table, "converting COPY block");
                    self.stats.copy_blocks += 1;
                    self.copy = CopyState::Active(CopyBlock::new(
                        header,
                        self.options.insert_batch_width,
                    ));
                }
                None => {
                    self.warnings.add(ParseWarning::UnparseableCopyHeader {
                        statement_preview: stmt.preview(100),
                    });
                    out.push(stmt.into_text());
                    self.copy = CopyState::Passthrough;
                }
            }
            return;
        }

        if stmt.kind() == StatementKind::Insert {
            self.stats.original_inserts += 1;
        }

        let relaxed = match &self.relaxer {
            Some(relaxer) => relaxer.relax(&stmt),
            None => Relaxed::Keep,
        };
        match relaxed {
            Relaxed::Keep => out.push(stmt.into_text()),
            Relaxed::Rewrite(text) => out.push(text),
            Relaxed::DatabaseCommand => {
                debug!(statement = %stmt.preview(80), "dropping database command");
                self.stats.database_commands_skipped += 1;
            }
            Relaxed::ConstraintSkipped(comment) => {
                self.stats.constraints_skipped += 1;
                out.push(format!("\n{}", comment));
            }
        }
    }

    fn process_copy_row(&mut self, row: &str, out: &mut Vec<String>) {
        match &mut self.copy {
            CopyState::Active(block) => {
                if let Some(insert) = block.push_row(row, self.transform.as_deref()) {
                    out.push(format!("\n{}", insert));
                }
            }
            CopyState::Suppressed => self.stats.protected_copy_rows += 1,
            CopyState::Passthrough => out.push(format!("\n{}", row)),
            CopyState::Idle => {
                self.warnings.add(ParseWarning::StrayCopyData {
                    line_preview: truncate_chars(row, 80),
                });
            }
        }
    }

    fn process_copy_end(&mut self, out: &mut Vec<String>) {
        match std::mem::replace(&mut self.copy, CopyState::Idle) {
            CopyState::Active(mut block) => {
                if let Some(insert) = block.finish() {
                    out.push(format!("\n{}", insert));
                }
                self.stats.copy_rows += block.rows();
                self.stats.inserts_generated += block.inserts();
                if block.column_mismatches() > 0 {
                    self.warnings.add(ParseWarning::ColumnCountMismatch {
                        table: block.header().table.clone(),
                        rows: block.column_mismatches(),
                    });
                }
            }
            CopyState::Passthrough => out.push("\n\\.".to_string()),
            CopyState::Suppressed | CopyState::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;
    use crate::parser::{StatementReader, TruncationPolicy};

    fn rewrite_with(sql: &str, options: RewriteOptions, source: Option<&str>) -> (String, TransformStats) {
        let rules = Arc::new(ProtectionRules::for_source(&ProtectionConfig::default(), source));
        let mut rw = DumpRewriter::new(options, rules);
        let mut out: Vec<String> = rw.prelude().map(|p| vec![p.to_string()]).unwrap_or_default();
        let mut reader = StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair);
        for item in reader.by_ref() {
            rw.process(item.unwrap(), &mut out);
        }
        if let Some(t) = reader.truncation() {
            rw.note_truncation(t);
        }
        let stats = rw.finish(0, sql.len() as u64, &mut out);
        (out.concat(), stats)
    }

    fn plain() -> RewriteOptions {
        RewriteOptions {
            relax_schema: false,
            disable_triggers: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_copy_block_becomes_insert() {
        let sql = "SET x = 1;\nCOPY widgets (id, name) FROM stdin;\n1\tAlpha\n2\t\\N\n\\.\nSELECT 1;\n";
        let (out, stats) = rewrite_with(sql, plain(), None);
        assert_eq!(
            out,
            "SET x = 1;\nINSERT INTO widgets (id, name) VALUES\n(1, 'Alpha'),\n(2, NULL);\nSELECT 1;"
        );
        assert_eq!(stats.copy_blocks, 1);
        assert_eq!(stats.copy_rows, 2);
        assert_eq!(stats.inserts_generated, 1);
    }

    #[test]
    fn test_protected_statement_replaced_by_comment() {
        let sql = "INSERT INTO etlstaging_batch VALUES (1); SELECT 2;";
        let (out, stats) = rewrite_with(sql, plain(), Some("ffc-doc-statement-data-test"));
        assert!(out.starts_with("\n-- PROTECTED TABLE EXCLUDED (transient-prefix, table etlstaging_batch)"));
        assert!(out.ends_with("\n SELECT 2;"));
        assert_eq!(stats.protected(ProtectionCategory::TransientPrefix), 1);
    }

    #[test]
    fn test_protected_copy_block_suppressed_whole() {
        let sql = "COPY public.databasechangelog (id) FROM stdin;\n1\n2\n3\n\\.\n";
        let (out, stats) = rewrite_with(sql, plain(), None);
        assert_eq!(out.matches("PROTECTED TABLE EXCLUDED").count(), 1);
        assert!(!out.contains("INSERT"));
        assert_eq!(stats.protected_copy_rows, 3);
        assert_eq!(stats.copy_rows, 0);
    }

    #[test]
    fn test_unparseable_copy_header_passes_through() {
        let sql = "COPY (SELECT 1) FROM stdin;\nraw\n\\.\n";
        let (out, stats) = rewrite_with(sql, plain(), None);
        assert_eq!(out, "COPY (SELECT 1) FROM stdin;\nraw\n\\.");
        assert_eq!(stats.warning_count, 1);
    }

    #[test]
    fn test_prelude_postlude_and_relaxation() {
        let sql = "CREATE DATABASE x;\nCREATE TABLE t (id int);\n\
                   ALTER TABLE ONLY t\n    ADD CONSTRAINT t_pkey PRIMARY KEY (id);\n";
        let (out, stats) = rewrite_with(sql, RewriteOptions::default(), None);
        assert!(out.starts_with(SESSION_PRELUDE));
        assert!(out.ends_with(SESSION_POSTLUDE));
        assert!(out.contains("CREATE TABLE IF NOT EXISTS t (id int);"));
        assert!(out.contains("-- SKIPPED CONSTRAINT: ALTER TABLE ONLY t\n--     ADD CONSTRAINT"));
        assert!(!out.contains("CREATE DATABASE"));
        assert_eq!(stats.database_commands_skipped, 1);
        assert_eq!(stats.constraints_skipped, 1);
    }

    #[test]
    fn test_truncation_recorded_as_warning() {
        let (out, stats) = rewrite_with("INSERT INTO t VALUES (1)", plain(), None);
        assert_eq!(out, "INSERT INTO t VALUES (1);\n");
        assert_eq!(stats.repaired_statements, 1);
        assert_eq!(stats.warning_count, 1);
        assert_eq!(stats.original_inserts, 1);
    }

    #[test]
    fn test_transform_hook_applies_to_copy_rows() {
        let rules = Arc::new(ProtectionRules::default());
        let scrub: Arc<dyn RowTransform> =
            Arc::new(|_: &str, _: &[String], cells: &mut [Cell]| {
                if let Some(c) = cells.get_mut(1) {
                    *c = Cell::Null;
                }
            });
        let mut rw = DumpRewriter::new(plain(), rules).with_transform(scrub);
        let mut out = Vec::new();
        let sql = "COPY p (id, email) FROM stdin;\n1\ta@b.c\n\\.\n";
        for item in StatementReader::new(sql.as_bytes(), TruncationPolicy::Repair) {
            rw.process(item.unwrap(), &mut out);
        }
        let text = out.concat();
        assert!(text.contains("(1, NULL)"));
    }
}
