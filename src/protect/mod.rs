//! Protected-table filter.
//!
//! Two rule classes decide whether a data- or schema-modifying statement may
//! reach the destination:
//!
//! - **transient prefix**: ETL staging tables recognised by a name prefix,
//!   enforced only for source databases known to carry them;
//! - **fixed names**: migration bookkeeping tables, always enforced.
//!
//! [`verify`] re-scans rewritten output independently of the tokenizer.

pub mod verify;

pub use verify::{scan_text, verify_file, Finding, VerifyReport};

use crate::config::ProtectionConfig;
use crate::parser::{truncate_chars, Statement};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every audit comment written in place of an excluded statement
pub const AUDIT_PREFIX: &str = "-- PROTECTED TABLE EXCLUDED";

/// Which rule class matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionCategory {
    TransientPrefix,
    FixedName,
}

impl ProtectionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionCategory::TransientPrefix => "transient-prefix",
            ProtectionCategory::FixedName => "fixed-name",
        }
    }
}

impl fmt::Display for ProtectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protection class and the names it matches
#[derive(Debug, Clone)]
pub enum ProtectionRule {
    TransientPrefix { prefix: String },
    FixedNames { names: AHashSet<String> },
}

impl ProtectionRule {
    pub fn transient_prefix(prefix: &str) -> Self {
        ProtectionRule::TransientPrefix {
            prefix: prefix.to_lowercase(),
        }
    }

    pub fn fixed_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ProtectionRule::FixedNames {
            names: names.into_iter().map(|n| n.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn category(&self) -> ProtectionCategory {
        match self {
            ProtectionRule::TransientPrefix { .. } => ProtectionCategory::TransientPrefix,
            ProtectionRule::FixedNames { .. } => ProtectionCategory::FixedName,
        }
    }

    /// `table` must already be lowercased and unqualified.
    pub fn matches(&self, table: &str) -> bool {
        match self {
            ProtectionRule::TransientPrefix { prefix } => table.starts_with(prefix.as_str()),
            ProtectionRule::FixedNames { names } => names.contains(table),
        }
    }
}

/// A statement or COPY block that matched a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionHit {
    pub category: ProtectionCategory,
    pub table: String,
}

/// The active rule set for one run. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct ProtectionRules {
    rules: Vec<ProtectionRule>,
}

impl ProtectionRules {
    pub fn new(rules: Vec<ProtectionRule>) -> Self {
        Self { rules }
    }

    /// Rules for a dump of `source_database`. The transient prefix rule is
    /// active only when the source database is in the configured allow-list.
    pub fn for_source(config: &ProtectionConfig, source_database: Option<&str>) -> Self {
        let mut rules = Vec::with_capacity(2);

        let transient_active = source_database.is_some_and(|db| {
            config
                .transient_databases
                .iter()
                .any(|d| d.eq_ignore_ascii_case(db))
        });
        if transient_active && !config.transient_prefix.is_empty() {
            rules.push(ProtectionRule::transient_prefix(&config.transient_prefix));
        }

        if !config.fixed_tables.is_empty() {
            rules.push(ProtectionRule::fixed_names(&config.fixed_tables));
        }

        Self { rules }
    }

    pub fn rules(&self) -> &[ProtectionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_category(&self, category: ProtectionCategory) -> bool {
        self.rules.iter().any(|r| r.category() == category)
    }

    /// Match a table name (any case, optionally schema-qualified or quoted)
    pub fn match_table(&self, table: &str) -> Option<ProtectionCategory> {
        let name = crate::parser::normalize_table_name(table)?;
        self.rules
            .iter()
            .find(|r| r.matches(&name))
            .map(|r| r.category())
    }

    /// Decide whether `stmt` must be excluded.
    pub fn check(&self, stmt: &Statement) -> Option<ProtectionHit> {
        if !stmt.kind().is_guarded() {
            return None;
        }
        let table = stmt.target_table()?;
        self.rules.iter().find(|r| r.matches(table)).map(|r| ProtectionHit {
            category: r.category(),
            table: table.to_string(),
        })
    }
}

/// Single-line comment written in place of an excluded statement.
pub fn audit_comment(hit: &ProtectionHit, stmt: &Statement) -> String {
    let opening = truncate_chars(&stmt.preview(200).replace('\r', ""), 100);
    format!(
        "{} ({}, table {}): {}",
        AUDIT_PREFIX, hit.category, hit.table, opening
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProtectionConfig {
        ProtectionConfig::default()
    }

    fn stmt(sql: &str) -> Statement {
        Statement::new(sql.to_string(), 0)
    }

    #[test]
    fn test_transient_rule_only_for_listed_sources() {
        let active = ProtectionRules::for_source(&config(), Some("ffc-doc-statement-data-test"));
        assert!(active.has_category(ProtectionCategory::TransientPrefix));

        let upper = ProtectionRules::for_source(&config(), Some("FFC-DOC-STATEMENT-DATA-DEV"));
        assert!(upper.has_category(ProtectionCategory::TransientPrefix));

        let inactive = ProtectionRules::for_source(&config(), Some("ffc-doc-statement-api"));
        assert!(!inactive.has_category(ProtectionCategory::TransientPrefix));
        assert!(inactive.has_category(ProtectionCategory::FixedName));

        let unknown = ProtectionRules::for_source(&config(), None);
        assert!(!unknown.has_category(ProtectionCategory::TransientPrefix));
    }

    #[test]
    fn test_check_guarded_kinds() {
        let rules = ProtectionRules::for_source(&config(), Some("ffc-doc-statement-data-test"));

        let hit = rules
            .check(&stmt("INSERT INTO etlstaging_batch VALUES (1);"))
            .unwrap();
        assert_eq!(hit.category, ProtectionCategory::TransientPrefix);
        assert_eq!(hit.table, "etlstaging_batch");

        let hit = rules
            .check(&stmt("TRUNCATE TABLE public.\"DATABASECHANGELOG\";"))
            .unwrap();
        assert_eq!(hit.category, ProtectionCategory::FixedName);

        assert!(rules
            .check(&stmt("ALTER TABLE ONLY public.etl_stage ADD COLUMN x int;"))
            .is_some());
        assert!(rules
            .check(&stmt("COPY public.databasechangeloglock (id) FROM stdin;"))
            .is_some());
    }

    #[test]
    fn test_check_ignores_reads_and_other_tables() {
        let rules = ProtectionRules::for_source(&config(), Some("ffc-doc-statement-data-test"));
        assert!(rules.check(&stmt("SELECT * FROM etl_stage;")).is_none());
        assert!(rules.check(&stmt("INSERT INTO widgets VALUES (1);")).is_none());
        assert!(rules.check(&stmt("INSERT INTO staging_etl VALUES (1);")).is_none());
    }

    #[test]
    fn test_match_table_normalizes() {
        let rules = ProtectionRules::for_source(&config(), None);
        assert_eq!(
            rules.match_table("public.DatabaseChangeLog"),
            Some(ProtectionCategory::FixedName)
        );
        assert_eq!(rules.match_table("widgets"), None);
    }

    #[test]
    fn test_audit_comment_is_single_line() {
        let rules = ProtectionRules::for_source(&config(), Some("ffc-doc-statement-data-dev"));
        let s = stmt("-- lead\nINSERT INTO etl_batch (id)\nVALUES (1);");
        let hit = rules.check(&s).unwrap();
        let comment = audit_comment(&hit, &s);
        assert!(!comment.contains('\n'));
        assert!(comment.starts_with(AUDIT_PREFIX));
        assert!(comment.contains("transient-prefix"));
        assert!(comment.ends_with("INSERT INTO etl_batch (id)"));
    }
}
