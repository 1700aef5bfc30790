//! Per-batch results and their run-level aggregate.

use crate::parser::{truncate_chars, StatementKind};
use crate::protect::ProtectionCategory;
use serde::Serialize;
use std::collections::BTreeMap;

/// Statement text kept in failure records and the error log
pub const FAILURE_PREVIEW_CHARS: usize = 500;

/// Why a statement was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    ProtectedTransient,
    ProtectedFixed,
    SchemaFiltered,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ProtectedTransient => "protected-transient",
            SkipReason::ProtectedFixed => "protected-fixed",
            SkipReason::SchemaFiltered => "schema-filtered",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProtectionCategory> for SkipReason {
    fn from(c: ProtectionCategory) -> Self {
        match c {
            ProtectionCategory::TransientPrefix => SkipReason::ProtectedTransient,
            ProtectionCategory::FixedName => SkipReason::ProtectedFixed,
        }
    }
}

/// One failed statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementFailure {
    pub kind: StatementKind,
    pub table: Option<String>,
    /// Statement text, truncated
    pub statement: String,
    pub message: String,
}

impl StatementFailure {
    pub fn new(
        kind: StatementKind,
        table: Option<&str>,
        sql: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            table: table.map(str::to_string),
            statement: truncate_chars(sql, FAILURE_PREVIEW_CHARS),
            message: message.into(),
        }
    }
}

/// Outcome of one executed batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    /// Table group the batch belongs to
    pub group: String,
    pub index: usize,
    pub succeeded: u64,
    pub errored: u64,
    pub skipped: u64,
    pub rows_affected: u64,
    pub executed_by_kind: BTreeMap<StatementKind, u64>,
    pub errored_by_kind: BTreeMap<StatementKind, u64>,
    pub skipped_by_reason: BTreeMap<SkipReason, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StatementFailure>,
}

impl BatchResult {
    pub fn new(group: &str, index: usize) -> Self {
        Self {
            group: group.to_string(),
            index,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, kind: StatementKind, rows: u64) {
        self.succeeded += 1;
        self.rows_affected += rows;
        *self.executed_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self, failure: StatementFailure) {
        self.errored += 1;
        *self.errored_by_kind.entry(failure.kind).or_insert(0) += 1;
        self.failures.push(failure);
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        *self.skipped_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn attempted(&self) -> u64 {
        self.succeeded + self.errored
    }
}

/// Aggregate over every batch of one executor run. Returned by value and
/// never touched again once the run completes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub dry_run: bool,
    pub statements_planned: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub rows_affected: u64,
    pub batches: u64,
    /// Statements skipped because a checkpoint recorded them as applied
    pub resumed_statements: u64,
    /// Dry run only: value tuples across INSERT statements
    pub estimated_rows: u64,
    pub executed_by_kind: BTreeMap<StatementKind, u64>,
    pub errored_by_kind: BTreeMap<StatementKind, u64>,
    pub skipped_by_reason: BTreeMap<SkipReason, u64>,
    /// Tables whose FK cycle forced first-seen ordering
    pub cyclic_tables: Vec<String>,
    /// Statements that reached no table group and ran in the final pass
    pub unordered_statements: u64,
    /// First failures, for the summary; the error log has all of them
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StatementFailure>,
}

/// Failures kept in memory for the summary
pub const MAX_KEPT_FAILURES: usize = 20;

impl ExecutionStats {
    pub fn absorb(&mut self, batch: BatchResult) {
        self.batches += 1;
        self.success_count += batch.succeeded;
        self.error_count += batch.errored;
        self.skipped_count += batch.skipped;
        self.rows_affected += batch.rows_affected;
        for (kind, n) in batch.executed_by_kind {
            *self.executed_by_kind.entry(kind).or_insert(0) += n;
        }
        for (kind, n) in batch.errored_by_kind {
            *self.errored_by_kind.entry(kind).or_insert(0) += n;
        }
        for (reason, n) in batch.skipped_by_reason {
            *self.skipped_by_reason.entry(reason).or_insert(0) += n;
        }
        let room = MAX_KEPT_FAILURES.saturating_sub(self.failures.len());
        self.failures.extend(batch.failures.into_iter().take(room));
    }

    pub fn executed(&self, kind: StatementKind) -> u64 {
        self.executed_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn errored(&self, kind: StatementKind) -> u64 {
        self.errored_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn skipped(&self, reason: SkipReason) -> u64 {
        self.skipped_by_reason.get(&reason).copied().unwrap_or(0)
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_accumulates() {
        let mut stats = ExecutionStats::default();

        let mut a = BatchResult::new("widgets", 0);
        a.record_success(StatementKind::Insert, 3);
        a.record_failure(StatementFailure::new(
            StatementKind::Insert,
            Some("widgets"),
            "INSERT INTO widgets VALUES (1);",
            "duplicate key",
        ));
        a.record_skip(SkipReason::SchemaFiltered);

        let mut b = BatchResult::new("widgets", 1);
        b.record_success(StatementKind::Update, 1);

        stats.absorb(a);
        stats.absorb(b);

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.skipped_count, 1);
        assert_eq!(stats.rows_affected, 4);
        assert_eq!(stats.executed(StatementKind::Insert), 1);
        assert_eq!(stats.executed(StatementKind::Update), 1);
        assert_eq!(stats.errored(StatementKind::Insert), 1);
        assert_eq!(stats.skipped(SkipReason::SchemaFiltered), 1);
        assert_eq!(stats.failures.len(), 1);
    }

    #[test]
    fn test_failure_statement_truncated() {
        let long = "x".repeat(2000);
        let f = StatementFailure::new(StatementKind::Other, None, &long, "bad");
        assert_eq!(f.statement.chars().count(), FAILURE_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_serializes_kind_keys_as_strings() {
        let mut stats = ExecutionStats::default();
        let mut b = BatchResult::new("t", 0);
        b.record_success(StatementKind::Insert, 1);
        b.record_skip(SkipReason::ProtectedFixed);
        stats.absorb(b);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["executed_by_kind"]["INSERT"], 1);
        assert_eq!(json["skipped_by_reason"]["protected-fixed"], 1);
    }
}
