//! One full pass over a dump: rewrite, verify, load.
//!
//! ```text
//! input.sql ─▶ AsyncStatementReader ─▶ DumpRewriter ─▶ output.sql
//!                                                        │
//!                                         verify_file ◀──┤
//!                                                        ▼
//!                           ExecutionPlan ─▶ BatchExecutor ─▶ destination
//! ```
//!
//! Each phase is bounded by its configured wall-clock ceiling and watched
//! by a [`Heartbeat`].

use crate::config::PipelineConfig;
use crate::convert::{ColumnScrubber, DumpRewriter, RewriteOptions, RowTransform, TransformStats};
use crate::error::{PipelineError, Result};
use crate::executor::{
    auto_batch_size, checkpoint_path, error_log_path, BatchExecutor, ExecutionOptions,
    ExecutionPlan, ExecutionStats, LoadTarget, SkipReason,
};
use crate::parser::{
    determine_buffer_size, determine_report_interval, AsyncStatementReader, DumpItem,
    StatementKind, TruncationPolicy,
};
use crate::progress::{Heartbeat, ProgressCounters};
use crate::protect::{verify_file, ProtectionCategory, ProtectionRules, VerifyReport};
use crate::schema::TableDependencyGraph;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{info, warn};

/// Which databases a pass copies between
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub source_database: Option<String>,
    pub target_database: Option<String>,
}

impl RunContext {
    pub fn new(source: Option<String>, target: Option<String>) -> Self {
        Self {
            source_database: source,
            target_database: target,
        }
    }
}

/// Final result of a pipeline pass
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub source_database: Option<String>,
    pub target_database: Option<String>,
    pub input: PathBuf,
    pub output: PathBuf,
    pub transform: TransformStats,
    pub verified_lines: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_log: Option<PathBuf>,
    pub elapsed_secs: f64,
}

impl RunStatistics {
    /// Any statement failed during the load
    pub fn has_errors(&self) -> bool {
        self.execution.as_ref().is_some_and(|e| e.has_errors())
    }

    /// Record the load of `self.output`; `started` is when the pass began.
    pub fn attach_execution(&mut self, execution: ExecutionStats, started: Instant) {
        self.error_log = execution
            .has_errors()
            .then(|| error_log_path(&self.output));
        self.execution = Some(execution);
        self.elapsed_secs = started.elapsed().as_secs_f64();
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.transform;
        writeln!(f, "Transform:")?;
        writeln!(
            f,
            "  Input: {} ({} lines, {:.2} MB)",
            self.input.display(),
            t.lines,
            mb(t.bytes)
        )?;
        writeln!(f, "  Output: {}", self.output.display())?;
        writeln!(f, "  Statements: {}", t.statements)?;
        writeln!(f, "  Original INSERTs: {}", t.original_inserts)?;
        writeln!(
            f,
            "  COPY blocks converted: {} ({} rows → {} INSERTs)",
            t.copy_blocks, t.copy_rows, t.inserts_generated
        )?;
        for category in [ProtectionCategory::TransientPrefix, ProtectionCategory::FixedName] {
            let n = t.protected(category);
            if n > 0 {
                writeln!(f, "  Protected ({}): {} statements excluded", category, n)?;
            }
        }
        if t.protected_copy_rows > 0 {
            writeln!(f, "  Protected COPY rows dropped: {}", t.protected_copy_rows)?;
        }
        if t.database_commands_skipped > 0 {
            writeln!(f, "  Database commands skipped: {}", t.database_commands_skipped)?;
        }
        if t.constraints_skipped > 0 {
            writeln!(f, "  Constraints skipped: {}", t.constraints_skipped)?;
        }
        if t.warning_count > 0 {
            writeln!(f, "  Warnings: {}", t.warning_count)?;
            for w in &t.warnings {
                writeln!(f, "    ⚠ {}", w)?;
            }
        }
        writeln!(f, "  Verified: {} lines, no protected operations", self.verified_lines)?;

        if let Some(e) = &self.execution {
            writeln!(f)?;
            if e.dry_run {
                writeln!(f, "Load (dry run):")?;
                writeln!(f, "  Statements that would run: {}", e.success_count)?;
                writeln!(f, "  Estimated rows: {}", e.estimated_rows)?;
            } else {
                writeln!(f, "Load:")?;
                writeln!(f, "  Executed: {}", e.success_count)?;
                writeln!(f, "  Errored: {}", e.error_count)?;
                writeln!(f, "  Rows affected: {}", e.rows_affected)?;
            }
            writeln!(f, "  Skipped: {}", e.skipped_count)?;
            writeln!(f, "  Batches: {}", e.batches)?;
            if e.resumed_statements > 0 {
                writeln!(f, "  Resumed after: {} statements", e.resumed_statements)?;
            }
            for kind in StatementKind::ALL {
                let done = e.executed(kind);
                let failed = e.errored(kind);
                if done > 0 || failed > 0 {
                    writeln!(
                        f,
                        "    {:<8} executed {:>8}  errored {:>6}",
                        kind.as_str(),
                        done,
                        failed
                    )?;
                }
            }
            for reason in [
                SkipReason::ProtectedTransient,
                SkipReason::ProtectedFixed,
                SkipReason::SchemaFiltered,
            ] {
                let n = e.skipped(reason);
                if n > 0 {
                    writeln!(f, "    skipped ({}): {}", reason, n)?;
                }
            }
            if !e.cyclic_tables.is_empty() {
                writeln!(f, "  FK cycle (first-seen order): {}", e.cyclic_tables.join(", "))?;
            }
            if let (true, Some(log)) = (e.has_errors(), &self.error_log) {
                writeln!(f, "  Error log: {}", log.display())?;
            }
        }
        write!(f, "Elapsed: {:.3}s", self.elapsed_secs)
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Run `fut` under a wall-clock ceiling.
pub async fn with_timeout<T, F>(phase: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout(phase, limit)),
    }
}

type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Transform, verify and load for one source database.
pub struct Pipeline {
    config: PipelineConfig,
    context: RunContext,
    rules: Arc<ProtectionRules>,
    transform: Option<Arc<dyn RowTransform>>,
    counters: Arc<ProgressCounters>,
    byte_progress: Option<ByteProgress>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, context: RunContext) -> Self {
        let rules = ProtectionRules::for_source(
            &config.protection,
            context.source_database.as_deref(),
        );
        let transform: Option<Arc<dyn RowTransform>> = if config.scrub.is_empty() {
            None
        } else {
            Some(Arc::new(ColumnScrubber::new(&config.scrub)))
        };
        Self {
            config,
            context,
            rules: Arc::new(rules),
            transform,
            counters: ProgressCounters::new(),
            byte_progress: None,
        }
    }

    /// Replace the row transform (the config scrubber by default).
    pub fn with_transform(mut self, transform: Arc<dyn RowTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Called with the input byte offset while transforming.
    pub fn with_byte_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.byte_progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn rules(&self) -> &Arc<ProtectionRules> {
        &self.rules
    }

    pub fn counters(&self) -> Arc<ProgressCounters> {
        Arc::clone(&self.counters)
    }

    fn label(&self, path: &Path) -> String {
        self.context
            .source_database
            .clone()
            .unwrap_or_else(|| path.display().to_string())
    }

    fn heartbeat(&self, path: &Path) -> Heartbeat {
        Heartbeat::spawn(
            self.label(path),
            Arc::clone(&self.counters),
            self.config.progress.heartbeat(),
            self.config.progress.stall(),
        )
    }

    fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            insert_batch_width: self.config.rewrite.insert_batch_width,
            relax_schema: self.config.rewrite.relax_schema,
            disable_triggers: self.config.rewrite.disable_triggers,
            source_database: self.context.source_database.clone(),
            target_database: self.context.target_database.clone(),
        }
    }

    /// Rewrite `input` into `output`.
    pub async fn transform_file(&self, input: &Path, output: &Path) -> Result<TransformStats> {
        let heartbeat = self.heartbeat(input);
        let result = with_timeout(
            "transform",
            self.config.timeouts.transform(),
            self.rewrite(input, output),
        )
        .await;
        heartbeat.stop().await;
        result
    }

    async fn rewrite(&self, input: &Path, output: &Path) -> Result<TransformStats> {
        if same_file(input, output) {
            return Err(PipelineError::Config(format!(
                "output {} would overwrite the input",
                output.display()
            )));
        }

        let file_size = tokio::fs::metadata(input).await?.len();
        self.counters.set_phase("transform", file_size);

        let file = File::open(input).await?;
        let reader = BufReader::with_capacity(determine_buffer_size(file_size), file);
        let counters = Arc::clone(&self.counters);
        let hook = self.byte_progress.clone();
        let mut items = AsyncStatementReader::new(reader, self.config.rewrite.on_truncated_input)
            .with_progress(determine_report_interval(file_size), move |pos| {
                counters.set_bytes(pos);
                if let Some(cb) = &hook {
                    cb(pos);
                }
            });

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut writer = BufWriter::new(File::create(output).await?);

        let mut rewriter = DumpRewriter::new(self.rewrite_options(), Arc::clone(&self.rules));
        if let Some(t) = &self.transform {
            rewriter = rewriter.with_transform(Arc::clone(t));
        }

        info!(
            input = %input.display(),
            output = %output.display(),
            bytes = file_size,
            "rewriting dump"
        );

        if let Some(prelude) = rewriter.prelude() {
            writer.write_all(prelude.as_bytes()).await?;
        }

        let mut chunks = Vec::new();
        while let Some(item) = items.next_item().await? {
            match &item {
                DumpItem::Statement(_) => self.counters.add_statements(1),
                DumpItem::CopyRow(_) => self.counters.add_rows(1),
                DumpItem::CopyEnd => {}
            }
            rewriter.process(item, &mut chunks);
            for chunk in chunks.drain(..) {
                writer.write_all(chunk.as_bytes()).await?;
            }
        }
        if let Some(t) = items.truncation() {
            rewriter.note_truncation(t);
        }

        let stats = rewriter.finish(items.lines(), items.offset(), &mut chunks);
        for chunk in chunks.drain(..) {
            writer.write_all(chunk.as_bytes()).await?;
        }
        writer.flush().await?;

        info!(
            statements = stats.statements,
            copy_blocks = stats.copy_blocks,
            copy_rows = stats.copy_rows,
            inserts = stats.inserts_generated,
            protected = stats.protected_total(),
            warnings = stats.warning_count,
            "rewrite finished"
        );
        Ok(stats)
    }

    /// Scan rewritten output for operations on protected tables.
    pub async fn verify(&self, path: &Path) -> Result<VerifyReport> {
        verify_file(path, &self.rules).await
    }

    /// Replay a rewritten file into `destination` in dependency order.
    pub async fn load<D>(&self, path: &Path, destination: &mut D) -> Result<ExecutionStats>
    where
        D: LoadTarget + ?Sized,
    {
        let heartbeat = self.heartbeat(path);
        let result = with_timeout(
            "load",
            self.config.timeouts.load(),
            self.replay(path, destination),
        )
        .await;
        heartbeat.stop().await;
        result
    }

    async fn replay<D>(&self, path: &Path, destination: &mut D) -> Result<ExecutionStats>
    where
        D: LoadTarget + ?Sized,
    {
        let meta = tokio::fs::metadata(path).await?;
        let file_size = meta.len();
        self.counters.set_phase("load", file_size);

        let schema = destination.schema_info().await?;
        let graph = TableDependencyGraph::from_schema(&schema);

        let file = File::open(path).await?;
        let reader = BufReader::with_capacity(determine_buffer_size(file_size), file);
        let counters = Arc::clone(&self.counters);
        let mut items = AsyncStatementReader::new(reader, TruncationPolicy::Repair)
            .with_progress(determine_report_interval(file_size), move |pos| {
                counters.set_bytes(pos)
            });

        let mut statements = Vec::new();
        let mut raw_copy_rows = 0u64;
        while let Some(item) = items.next_item().await? {
            match item {
                DumpItem::Statement(stmt) if stmt.is_copy_from_stdin() => {
                    warn!(
                        statement = %stmt.preview(80),
                        "COPY FROM stdin cannot be replayed statement by statement; block skipped"
                    );
                }
                DumpItem::Statement(stmt) => statements.push(stmt),
                DumpItem::CopyRow(_) => raw_copy_rows += 1,
                DumpItem::CopyEnd => {}
            }
        }
        if raw_copy_rows > 0 {
            warn!(rows = raw_copy_rows, "raw COPY rows left in rewritten file were not loaded");
        }

        let plan = ExecutionPlan::build(statements, &graph);
        let exec = &self.config.execution;
        let options = ExecutionOptions {
            batch_size: exec.batch_size.unwrap_or_else(|| auto_batch_size(file_size)),
            dry_run: exec.dry_run,
            data_only: exec.data_only,
            atomic_batches: exec.atomic_batches,
            error_log: Some(error_log_path(path)),
            checkpoint: exec.checkpoint.then(|| checkpoint_path(path)),
        };

        BatchExecutor::new(options, Arc::clone(&self.rules))
            .with_progress(Arc::clone(&self.counters))
            .execute(destination, plan)
            .await
    }

    /// Transform and verify only.
    pub async fn prepare(&self, input: &Path, output: &Path) -> Result<RunStatistics> {
        let started = Instant::now();
        let transform = self.transform_file(input, output).await?;
        let report = self.verify(output).await?;
        Ok(RunStatistics {
            source_database: self.context.source_database.clone(),
            target_database: self.context.target_database.clone(),
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            transform,
            verified_lines: report.lines_scanned,
            execution: None,
            error_log: None,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Transform, verify, then load. A protection violation stops the run
    /// before anything is sent to the destination.
    pub async fn run<D>(&self, input: &Path, output: &Path, destination: &mut D) -> Result<RunStatistics>
    where
        D: LoadTarget + ?Sized,
    {
        let started = Instant::now();
        let mut stats = self.prepare(input, output).await?;
        let execution = self.load(output, destination).await?;
        stats.attach_execution(execution, started);
        Ok(stats)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}
