//! Dependency-ordered batch executor.
//!
//! Statements are planned into three passes:
//!
//! 1. session settings seen before any data statement, in file order;
//! 2. one group per destination table, groups in FK order (referenced
//!    tables first), statements in file order within a group;
//! 3. everything else, in file order.
//!
//! Each pass is cut into batches of `batch_size` statements. A failing
//! statement is recorded and skipped; only a lost connection stops the run.
//! With a checkpoint, applied positions are recorded per group so a rerun
//! continues after the last applied statement.

mod checkpoint;
mod error_log;
pub mod postgres;
mod result;

pub use checkpoint::{checkpoint_path, Checkpoint};
pub use error_log::{error_log_path, ErrorLog};
pub use result::{
    BatchResult, ExecutionStats, SkipReason, StatementFailure, FAILURE_PREVIEW_CHARS,
    MAX_KEPT_FAILURES,
};

use crate::error::{PipelineError, Result};
use crate::parser::{Statement, StatementKind};
use crate::progress::ProgressCounters;
use crate::protect::ProtectionRules;
use crate::schema::{SchemaInfo, SchemaSource, TableDependencyGraph};
use ahash::AHashMap;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Batch size for rewritten files above the large-file threshold
pub const LARGE_FILE_BATCH_SIZE: usize = 50;
/// Batch size otherwise
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Group name of the leading session-settings pass
pub const SESSION_GROUP: &str = "__session";
/// Group name of the final unordered pass
pub const FINAL_GROUP: &str = "__other";

/// Failure reported by a [`Destination`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The statement failed; the connection is still usable
    #[error("{message}")]
    Statement {
        message: String,
        code: Option<String>,
    },
    /// The connection is gone
    #[error("connection lost: {0}")]
    Connection(String),
}

impl ExecError {
    pub fn statement(message: impl Into<String>) -> Self {
        ExecError::Statement {
            message: message.into(),
            code: None,
        }
    }
}

/// A live destination database connection, owned by one executor.
#[async_trait]
pub trait Destination: Send {
    /// Run one statement; returns rows affected.
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, ExecError>;

    async fn begin(&mut self) -> std::result::Result<(), ExecError> {
        self.execute("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> std::result::Result<(), ExecError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> std::result::Result<(), ExecError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }
}

/// A destination that can also describe its schema, as needed by a load.
pub trait LoadTarget: Destination + SchemaSource {}

impl<T: Destination + SchemaSource> LoadTarget for T {}

/// Destination with no database behind it: every statement succeeds and
/// the schema is empty, so all data lands in the final pass. Used for dry
/// runs without a connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

#[async_trait]
impl Destination for Offline {
    async fn execute(&mut self, _sql: &str) -> std::result::Result<u64, ExecError> {
        Ok(0)
    }
}

#[async_trait]
impl SchemaSource for Offline {
    async fn schema_info(&mut self) -> Result<SchemaInfo> {
        Ok(SchemaInfo::new())
    }
}

/// Pick the execution batch size for a rewritten file of `file_size` bytes.
pub fn auto_batch_size(file_size: u64) -> usize {
    if file_size > crate::parser::LARGE_FILE_THRESHOLD {
        LARGE_FILE_BATCH_SIZE
    } else {
        DEFAULT_BATCH_SIZE
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub batch_size: usize,
    pub dry_run: bool,
    /// Skip CREATE/ALTER/DROP statements
    pub data_only: bool,
    /// Wrap each batch in a transaction with a savepoint per statement
    pub atomic_batches: bool,
    pub error_log: Option<PathBuf>,
    /// Checkpoint file for resumable loads
    pub checkpoint: Option<PathBuf>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            data_only: true,
            atomic_batches: false,
            error_log: None,
            checkpoint: None,
        }
    }
}

/// One named pass of statements
#[derive(Debug, Clone)]
pub struct StatementGroup {
    pub name: String,
    pub statements: Vec<Statement>,
}

/// Statements arranged for execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub session: Vec<Statement>,
    /// Table groups in dependency order
    pub tables: Vec<StatementGroup>,
    pub trailing: Vec<Statement>,
    pub cyclic_tables: Vec<String>,
}

impl ExecutionPlan {
    /// Arrange `statements` using `graph`. Blank statements are dropped.
    pub fn build<I>(statements: I, graph: &TableDependencyGraph) -> Self
    where
        I: IntoIterator<Item = Statement>,
    {
        let mut plan = ExecutionPlan::default();
        let mut by_table: AHashMap<String, Vec<Statement>> = AHashMap::new();
        let mut seen_data = false;

        for stmt in statements {
            if stmt.is_blank() {
                continue;
            }
            if stmt.is_session_setting() && !seen_data {
                plan.session.push(stmt);
                continue;
            }
            if stmt.kind().is_data_modifying() {
                seen_data = true;
                if let Some(table) = stmt.target_table() {
                    if graph.contains(table) {
                        by_table.entry(table.to_string()).or_default().push(stmt);
                        continue;
                    }
                }
            }
            plan.trailing.push(stmt);
        }

        let resolved = graph.resolve();
        for table in resolved.order {
            if let Some(statements) = by_table.remove(&table) {
                plan.tables.push(StatementGroup {
                    name: table,
                    statements,
                });
            }
        }
        plan.cyclic_tables = resolved
            .cyclic_groups
            .into_iter()
            .flatten()
            .filter(|t| plan.tables.iter().any(|g| &g.name == t))
            .collect();
        plan
    }

    pub fn len(&self) -> usize {
        self.session.len()
            + self.tables.iter().map(|g| g.statements.len()).sum::<usize>()
            + self.trailing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table names in execution order
    pub fn table_order(&self) -> Vec<&str> {
        self.tables.iter().map(|g| g.name.as_str()).collect()
    }

    /// Every pass as `(group name, statements)`, in execution order.
    pub fn passes(&self) -> impl Iterator<Item = (&str, &[Statement])> + '_ {
        std::iter::once((SESSION_GROUP, self.session.as_slice()))
            .chain(
                self.tables
                    .iter()
                    .map(|g| (g.name.as_str(), g.statements.as_slice())),
            )
            .chain(std::iter::once((FINAL_GROUP, self.trailing.as_slice())))
    }

    /// SHA-256 over group names and statement bodies. Checkpoint positions
    /// only hold for a plan with the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, statements) in self.passes() {
            hasher.update(name.as_bytes());
            hasher.update((statements.len() as u64).to_le_bytes());
            for stmt in statements {
                hasher.update(stmt.sql().as_bytes());
                hasher.update([0u8]);
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Executes an [`ExecutionPlan`] against a [`Destination`].
pub struct BatchExecutor {
    options: ExecutionOptions,
    rules: Arc<ProtectionRules>,
    progress: Option<Arc<ProgressCounters>>,
}

impl BatchExecutor {
    pub fn new(options: ExecutionOptions, rules: Arc<ProtectionRules>) -> Self {
        Self {
            options,
            rules,
            progress: None,
        }
    }

    pub fn with_progress(mut self, counters: Arc<ProgressCounters>) -> Self {
        self.progress = Some(counters);
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run every pass of `plan`. Statement failures are counted; a lost
    /// connection returns [`PipelineError::Connection`].
    pub async fn execute<D>(&self, destination: &mut D, plan: ExecutionPlan) -> Result<ExecutionStats>
    where
        D: Destination + ?Sized,
    {
        let mut stats = ExecutionStats {
            dry_run: self.options.dry_run,
            statements_planned: plan.len() as u64,
            unordered_statements: plan.trailing.len() as u64,
            cyclic_tables: plan.cyclic_tables.clone(),
            ..Default::default()
        };

        if !stats.cyclic_tables.is_empty() {
            warn!(
                tables = %stats.cyclic_tables.join(", "),
                "foreign key cycle; these tables run in first-seen order"
            );
        }
        info!(
            statements = stats.statements_planned,
            tables = plan.tables.len(),
            batch_size = self.options.batch_size,
            dry_run = self.options.dry_run,
            "executing plan"
        );

        let mut checkpoint = match &self.options.checkpoint {
            Some(path) if !self.options.dry_run => {
                Some(Checkpoint::open(path.clone(), &plan.fingerprint()).await?)
            }
            _ => None,
        };
        let mut error_log = match &self.options.error_log {
            Some(path) if !self.options.dry_run => Some(ErrorLog::new(path.clone())),
            _ => None,
        };

        let mut run = Run {
            executor: self,
            destination,
            checkpoint: checkpoint.as_mut(),
            error_log: error_log.as_mut(),
            stats: &mut stats,
        };

        run.pass(SESSION_GROUP, &plan.session, false).await?;
        for group in &plan.tables {
            run.pass(&group.name, &group.statements, true).await?;
        }
        run.pass(FINAL_GROUP, &plan.trailing, true).await?;

        if let Some(log) = error_log.as_mut() {
            log.flush().await?;
        }
        if let Some(cp) = checkpoint {
            cp.clear().await?;
        }

        info!(
            succeeded = stats.success_count,
            errored = stats.error_count,
            skipped = stats.skipped_count,
            rows = stats.rows_affected,
            "execution finished"
        );
        Ok(stats)
    }

    /// Why `stmt` must not be sent, if at all.
    fn skip_reason(&self, stmt: &Statement) -> Option<SkipReason> {
        if let Some(hit) = self.rules.check(stmt) {
            return Some(hit.category.into());
        }
        if self.options.data_only && stmt.kind().is_schema() {
            return Some(SkipReason::SchemaFiltered);
        }
        None
    }
}

/// Mutable state of one `execute` call
struct Run<'a, D: Destination + ?Sized> {
    executor: &'a BatchExecutor,
    destination: &'a mut D,
    checkpoint: Option<&'a mut Checkpoint>,
    error_log: Option<&'a mut ErrorLog>,
    stats: &'a mut ExecutionStats,
}

impl<D: Destination + ?Sized> Run<'_, D> {
    async fn pass(&mut self, group: &str, statements: &[Statement], resumable: bool) -> Result<()> {
        let size = self.executor.options.batch_size.max(1);
        let start = match self.checkpoint.as_deref() {
            Some(cp) if resumable => cp.done_through(group).min(statements.len()),
            _ => 0,
        };
        if start > 0 {
            debug!(group, statements = start, "already applied, resuming after them");
            self.stats.resumed_statements += start as u64;
            if let Some(p) = &self.executor.progress {
                p.add_statements(start as u64);
            }
        }

        let mut offset = start;
        for (index, chunk) in statements[start..].chunks(size).enumerate() {
            let track = resumable.then_some(offset);
            let result = self.batch(group, index, chunk, track).await?;
            offset += chunk.len();

            if let Some(log) = self.error_log.as_deref_mut() {
                for failure in &result.failures {
                    log.append(failure).await?;
                }
            }
            if resumable {
                if let Some(cp) = self.checkpoint.as_deref_mut() {
                    cp.record(group, offset).await?;
                }
            }
            if let Some(p) = &self.executor.progress {
                p.add_statements(result.attempted() + result.skipped);
                p.add_rows(result.rows_affected);
            }

            debug!(
                group,
                index,
                succeeded = result.succeeded,
                errored = result.errored,
                skipped = result.skipped,
                "batch done"
            );
            self.stats.absorb(result);
        }
        Ok(())
    }

    /// Keep what a non-atomic batch applied before the connection dropped.
    /// The statement in flight is not counted and runs again on resume.
    async fn save_partial(&mut self, group: &str, through: usize) {
        if let Some(cp) = self.checkpoint.as_deref_mut() {
            if let Err(e) = cp.record(group, through).await {
                warn!(group, error = %e, "could not record partial batch in checkpoint");
            }
        }
    }

    /// `track` is the group position of `chunk[0]` when progress is checkpointed.
    async fn batch(
        &mut self,
        group: &str,
        index: usize,
        chunk: &[Statement],
        track: Option<usize>,
    ) -> Result<BatchResult> {
        let mut result = BatchResult::new(group, index);
        let dry_run = self.executor.options.dry_run;
        let atomic = self.executor.options.atomic_batches && !dry_run;

        if atomic {
            self.destination.begin().await.map_err(connection_error)?;
        }

        for (i, stmt) in chunk.iter().enumerate() {
            if let Some(reason) = self.executor.skip_reason(stmt) {
                if matches!(reason, SkipReason::ProtectedFixed | SkipReason::ProtectedTransient) {
                    warn!(
                        table = stmt.target_table().unwrap_or("-"),
                        kind = %stmt.kind(),
                        "protected statement reached the executor, skipped"
                    );
                }
                result.record_skip(reason);
                continue;
            }

            if dry_run {
                self.stats.estimated_rows += estimate_rows(stmt);
                result.record_success(stmt.kind(), 0);
                continue;
            }

            let outcome = if atomic {
                self.execute_in_savepoint(stmt.sql()).await
            } else {
                self.destination.execute(stmt.sql()).await
            };

            match outcome {
                Ok(rows) => result.record_success(stmt.kind(), rows),
                Err(ExecError::Statement { message, .. }) => {
                    debug!(group, error = %message, "statement failed");
                    result.record_failure(StatementFailure::new(
                        stmt.kind(),
                        stmt.target_table(),
                        stmt.sql(),
                        message,
                    ));
                }
                Err(e @ ExecError::Connection(_)) => {
                    if let (Some(at), false) = (track, atomic) {
                        self.save_partial(group, at + i).await;
                    }
                    return Err(connection_error(e));
                }
            }
        }

        if atomic {
            self.destination.commit().await.map_err(connection_error)?;
        }
        Ok(result)
    }

    async fn execute_in_savepoint(&mut self, sql: &str) -> std::result::Result<u64, ExecError> {
        self.destination.execute("SAVEPOINT dumpshift_stmt").await?;
        match self.destination.execute(sql).await {
            Ok(rows) => {
                self.destination
                    .execute("RELEASE SAVEPOINT dumpshift_stmt")
                    .await?;
                Ok(rows)
            }
            Err(ExecError::Statement { message, code }) => {
                self.destination
                    .execute("ROLLBACK TO SAVEPOINT dumpshift_stmt")
                    .await?;
                Err(ExecError::Statement { message, code })
            }
            Err(e) => Err(e),
        }
    }
}

fn connection_error(e: ExecError) -> PipelineError {
    PipelineError::Connection(e.to_string())
}

/// Approximate rows an INSERT would write: its value tuples.
pub fn estimate_rows(stmt: &Statement) -> u64 {
    if stmt.kind() != StatementKind::Insert {
        return 0;
    }
    stmt.sql().matches("),\n(").count() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;
    use crate::parser::split_statements;

    /// Records executed SQL; fails statements containing `fail_on`.
    #[derive(Default)]
    struct Recorder {
        executed: Vec<String>,
        fail_on: Option<String>,
        drop_on: Option<String>,
    }

    #[async_trait]
    impl Destination for Recorder {
        async fn execute(&mut self, sql: &str) -> std::result::Result<u64, ExecError> {
            self.executed.push(sql.to_string());
            if let Some(d) = &self.drop_on {
                if sql.contains(d.as_str()) {
                    return Err(ExecError::Connection("server closed the connection".into()));
                }
            }
            if let Some(f) = &self.fail_on {
                if sql.contains(f.as_str()) {
                    return Err(ExecError::statement("duplicate key value violates unique constraint"));
                }
            }
            Ok(1)
        }
    }

    fn chain_graph() -> TableDependencyGraph {
        let mut g = TableDependencyGraph::new();
        g.add_dependency("a", "b");
        g.add_dependency("b", "c");
        g
    }

    fn executor(options: ExecutionOptions) -> BatchExecutor {
        let rules = ProtectionRules::for_source(&ProtectionConfig::default(), None);
        BatchExecutor::new(options, Arc::new(rules))
    }

    fn plan(sql: &str, graph: &TableDependencyGraph) -> ExecutionPlan {
        ExecutionPlan::build(split_statements(sql).unwrap(), graph)
    }

    #[test]
    fn test_fingerprint_follows_plan_content() {
        let g = chain_graph();
        let sql = "INSERT INTO c VALUES (1);\nINSERT INTO a VALUES (1);\n";
        let base = plan(sql, &g).fingerprint();

        assert_eq!(base.len(), 64);
        assert_eq!(plan(&format!("-- header\n{}", sql), &g).fingerprint(), base);
        let changed = plan("INSERT INTO c VALUES (2);\nINSERT INTO a VALUES (1);\n", &g);
        assert_ne!(changed.fingerprint(), base);
        assert_ne!(plan(sql, &TableDependencyGraph::new()).fingerprint(), base);
    }

    #[test]
    fn test_plan_routes_statements() {
        let sql = "SET a = 1;\nINSERT INTO a VALUES (1);\nINSERT INTO c VALUES (1);\n\
                   CREATE TABLE z (id int);\nINSERT INTO z VALUES (1);\n\
                   SET session_replication_role = DEFAULT;\n-- trailing comment\n";
        let p = plan(sql, &chain_graph());
        assert_eq!(p.session.len(), 1);
        assert_eq!(p.table_order(), vec!["c", "a"]);
        assert_eq!(p.trailing.len(), 3);
        assert_eq!(p.len(), 6);
    }

    #[tokio::test]
    async fn test_chain_executes_referenced_tables_first() {
        let sql = "INSERT INTO a VALUES (1);\nINSERT INTO b VALUES (1);\nINSERT INTO c VALUES (1);\n\
                   INSERT INTO a VALUES (2);\nINSERT INTO c VALUES (2);\n";
        let mut dest = Recorder::default();
        let stats = executor(ExecutionOptions::default())
            .execute(&mut dest, plan(sql, &chain_graph()))
            .await
            .unwrap();

        assert_eq!(
            dest.executed,
            vec![
                "INSERT INTO c VALUES (1);",
                "INSERT INTO c VALUES (2);",
                "INSERT INTO b VALUES (1);",
                "INSERT INTO a VALUES (1);",
                "INSERT INTO a VALUES (2);",
            ]
        );
        assert_eq!(stats.success_count, 5);
        assert_eq!(stats.executed(StatementKind::Insert), 5);
    }

    #[tokio::test]
    async fn test_statement_error_is_isolated() {
        let sql = "INSERT INTO c VALUES (1);\nINSERT INTO c VALUES (2);\nINSERT INTO c VALUES (3);\n";
        let mut dest = Recorder {
            fail_on: Some("(2)".into()),
            ..Default::default()
        };
        let stats = executor(ExecutionOptions::default())
            .execute(&mut dest, plan(sql, &chain_graph()))
            .await
            .unwrap();

        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 2);
        assert_eq!(dest.executed.len(), 3);
        assert_eq!(stats.failures[0].statement, "INSERT INTO c VALUES (2);");
    }

    #[tokio::test]
    async fn test_connection_loss_aborts() {
        let sql = "INSERT INTO c VALUES (1);\nINSERT INTO c VALUES (2);\nINSERT INTO c VALUES (3);\n";
        let mut dest = Recorder {
            drop_on: Some("(2)".into()),
            ..Default::default()
        };
        let err = executor(ExecutionOptions::default())
            .execute(&mut dest, plan(sql, &chain_graph()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Connection(_)));
        assert_eq!(dest.executed.len(), 2);
    }

    #[tokio::test]
    async fn test_protected_and_schema_statements_skipped() {
        let sql = "CREATE TABLE IF NOT EXISTS c (id int);\nINSERT INTO databasechangelog VALUES (1);\n\
                   INSERT INTO c VALUES (1);\n";
        let mut dest = Recorder::default();
        let stats = executor(ExecutionOptions::default())
            .execute(&mut dest, plan(sql, &chain_graph()))
            .await
            .unwrap();

        assert_eq!(dest.executed, vec!["INSERT INTO c VALUES (1);"]);
        assert_eq!(stats.skipped(SkipReason::SchemaFiltered), 1);
        assert_eq!(stats.skipped(SkipReason::ProtectedFixed), 1);
        assert_eq!(stats.skipped_count, 2);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let sql = "INSERT INTO c (id) VALUES\n(1),\n(2),\n(3);\nUPDATE b SET x = 1;\n";
        let mut dest = Recorder::default();
        let stats = executor(ExecutionOptions {
            dry_run: true,
            ..Default::default()
        })
        .execute(&mut dest, plan(sql, &chain_graph()))
        .await
        .unwrap();

        assert!(dest.executed.is_empty());
        assert!(stats.dry_run);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.estimated_rows, 3);
    }

    #[tokio::test]
    async fn test_atomic_batches_use_savepoints() {
        let sql = "INSERT INTO c VALUES (1);\nINSERT INTO c VALUES (2);\n";
        let mut dest = Recorder {
            fail_on: Some("(2)".into()),
            ..Default::default()
        };
        let stats = executor(ExecutionOptions {
            atomic_batches: true,
            ..Default::default()
        })
        .execute(&mut dest, plan(sql, &chain_graph()))
        .await
        .unwrap();

        assert_eq!(
            dest.executed,
            vec![
                "BEGIN",
                "SAVEPOINT dumpshift_stmt",
                "INSERT INTO c VALUES (1);",
                "RELEASE SAVEPOINT dumpshift_stmt",
                "SAVEPOINT dumpshift_stmt",
                "INSERT INTO c VALUES (2);",
                "ROLLBACK TO SAVEPOINT dumpshift_stmt",
                "COMMIT",
            ]
        );
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn test_batches_respect_size() {
        let sql: String = (0..5).map(|i| format!("INSERT INTO c VALUES ({});\n", i)).collect();
        let mut dest = Recorder::default();
        let stats = executor(ExecutionOptions {
            batch_size: 2,
            ..Default::default()
        })
        .execute(&mut dest, plan(&sql, &chain_graph()))
        .await
        .unwrap();
        // 3 table batches + empty session and final passes
        assert_eq!(stats.batches, 3);
    }

    #[test]
    fn test_auto_batch_size() {
        assert_eq!(auto_batch_size(1024), DEFAULT_BATCH_SIZE);
        assert_eq!(
            auto_batch_size(crate::parser::LARGE_FILE_THRESHOLD + 1),
            LARGE_FILE_BATCH_SIZE
        );
    }
}
