//! Multi-database runs.
//!
//! One job per source database: dump, transform, verify, load. At most
//! `concurrency` jobs are in flight; a failing job never touches its
//! siblings, and every job reports its own outcome.

use crate::config::{DatabaseJob, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::executor::postgres::PgDestination;
use crate::executor::{LoadTarget, Offline};
use crate::pipeline::{with_timeout, Pipeline, RunContext, RunStatistics};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Produces a plain-SQL dump file for a source database.
#[async_trait]
pub trait DumpProvider: Send + Sync {
    async fn dump(&self, database: &str) -> Result<PathBuf>;
}

/// Dumps already on disk as `<dir>/<database>.sql`
#[derive(Debug, Clone)]
pub struct DirectoryDumps {
    dir: PathBuf,
}

impl DirectoryDumps {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, database: &str) -> PathBuf {
        self.dir.join(format!("{}.sql", database))
    }
}

#[async_trait]
impl DumpProvider for DirectoryDumps {
    async fn dump(&self, database: &str) -> Result<PathBuf> {
        let path = self.path_for(database);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(PipelineError::dump(
                database,
                format!("{} is not a file", path.display()),
            )),
            Err(e) => Err(PipelineError::dump(
                database,
                format!("{}: {}", path.display(), e),
            )),
        }
    }
}

/// Opens a destination connection for a target database.
#[async_trait]
pub trait DestinationFactory: Send + Sync {
    async fn connect(&self, database: &str) -> Result<Box<dyn LoadTarget>>;
}

/// tokio-postgres connections from a libpq-style connection string
#[derive(Debug, Clone)]
pub struct PgConnector {
    connection: String,
}

impl PgConnector {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
        }
    }
}

#[async_trait]
impl DestinationFactory for PgConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn LoadTarget>> {
        let dest = PgDestination::connect(&self.connection, database).await?;
        Ok(Box::new(dest))
    }
}

#[async_trait]
impl DestinationFactory for Offline {
    async fn connect(&self, _database: &str) -> Result<Box<dyn LoadTarget>> {
        Ok(Box::new(Offline))
    }
}

/// Result for one database of a batch
#[derive(Debug, Serialize)]
pub struct DatabaseOutcome {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<RunStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure came from the safety verification scan
    pub protection_violation: bool,
}

impl DatabaseOutcome {
    fn completed(job: &DatabaseJob, statistics: RunStatistics) -> Self {
        Self {
            source: job.source.clone(),
            target: job.target().to_string(),
            statistics: Some(statistics),
            error: None,
            protection_violation: false,
        }
    }

    fn failed(job: &DatabaseJob, message: String, protection_violation: bool) -> Self {
        Self {
            source: job.source.clone(),
            target: job.target().to_string(),
            statistics: None,
            error: Some(message),
            protection_violation,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcomes of a batch run, in job order
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub outcomes: Vec<DatabaseOutcome>,
    pub elapsed_secs: f64,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Databases that failed or had statement errors
    pub fn unhealthy(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded() || o.statistics.as_ref().is_some_and(|s| s.has_errors()))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.unhealthy() > 0
    }
}

/// Runs every configured database job.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    dumps: Arc<dyn DumpProvider>,
    destinations: Arc<dyn DestinationFactory>,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        dumps: Arc<dyn DumpProvider>,
        destinations: Arc<dyn DestinationFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let output_dir = config
            .output_dir
            .clone()
            .or_else(|| config.dump_dir.clone())
            .ok_or_else(|| PipelineError::Config("output_dir or dump_dir is required".into()))?;
        Ok(Self {
            config: Arc::new(config),
            dumps,
            destinations,
            output_dir,
        })
    }

    /// Directory dumps plus a tokio-postgres destination; dry runs without
    /// a destination use [`Offline`].
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let dump_dir = config
            .dump_dir
            .clone()
            .ok_or_else(|| PipelineError::Config("dump_dir is required for batch runs".into()))?;
        let destinations: Arc<dyn DestinationFactory> = match &config.destination {
            Some(conn) => Arc::new(PgConnector::new(conn.clone())),
            None if config.execution.dry_run => Arc::new(Offline),
            None => {
                return Err(PipelineError::Config(
                    "destination is required unless execution.dry_run is set".into(),
                ))
            }
        };
        Self::new(config, Arc::new(DirectoryDumps::new(dump_dir)), destinations)
    }

    pub fn output_path(&self, source: &str) -> PathBuf {
        rewritten_path(&self.output_dir, source)
    }

    pub async fn run(&self) -> BatchSummary {
        let started = Instant::now();
        let jobs = self.config.databases.clone();
        if jobs.is_empty() {
            warn!("no databases configured");
        }
        info!(
            databases = jobs.len(),
            concurrency = self.config.concurrency,
            "starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let config = Arc::clone(&self.config);
            let dumps = Arc::clone(&self.dumps);
            let destinations = Arc::clone(&self.destinations);
            let output = self.output_path(&job.source);
            let task_job = job.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_job(&config, &task_job, dumps.as_ref(), destinations.as_ref(), &output).await
            });
            handles.push((job, handle));
        }

        let mut summary = BatchSummary::default();
        for (job, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(stats)) => {
                    info!(source = %job.source, errors = stats.has_errors(), "database finished");
                    DatabaseOutcome::completed(&job, stats)
                }
                Ok(Err(e)) => {
                    error!(source = %job.source, "database failed: {}", e);
                    DatabaseOutcome::failed(&job, e.to_string(), e.is_protection_violation())
                }
                Err(e) => {
                    error!(source = %job.source, "database task panicked: {}", e);
                    DatabaseOutcome::failed(&job, format!("task panicked: {}", e), false)
                }
            };
            summary.outcomes.push(outcome);
        }
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        summary
    }
}

fn rewritten_path(dir: &Path, source: &str) -> PathBuf {
    dir.join(format!("{}.rewritten.sql", source))
}

async fn run_job(
    config: &PipelineConfig,
    job: &DatabaseJob,
    dumps: &dyn DumpProvider,
    destinations: &dyn DestinationFactory,
    output: &Path,
) -> Result<RunStatistics> {
    let started = Instant::now();
    info!(source = %job.source, target = job.target(), "dumping");
    let dump = with_timeout("dump", config.timeouts.dump(), dumps.dump(&job.source)).await?;

    let context = RunContext::new(Some(job.source.clone()), Some(job.target().to_string()));
    let pipeline = Pipeline::new(config.clone(), context);
    let mut stats = pipeline.prepare(&dump, output).await?;

    // Connect only after verification passed.
    let mut destination = destinations.connect(job.target()).await?;
    let execution = pipeline.load(output, destination.as_mut()).await?;
    stats.attach_execution(execution, started);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path, databases: &[&str]) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.dump_dir = Some(dir.to_path_buf());
        config.execution.dry_run = true;
        config.databases = databases
            .iter()
            .map(|s| DatabaseJob {
                source: s.to_string(),
                target: None,
            })
            .collect();
        config
    }

    #[tokio::test]
    async fn test_missing_dump_fails_only_that_database() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.sql"), "INSERT INTO t VALUES (1);\n").unwrap();

        let orch = Orchestrator::from_config(config(dir.path(), &["good", "missing"])).unwrap();
        let summary = orch.run().await;

        assert_eq!(summary.outcomes.len(), 2);
        assert!(summary.outcomes[0].succeeded());
        assert!(!summary.outcomes[1].succeeded());
        assert!(summary.outcomes[1].error.as_deref().unwrap().contains("missing"));
        assert_eq!(summary.failed(), 1);
        assert!(summary.has_failures());
        assert!(dir.path().join("good.rewritten.sql").exists());
    }

    #[test]
    fn test_from_config_requires_destination_for_real_runs() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), &["a"]);
        cfg.execution.dry_run = false;
        assert!(matches!(
            Orchestrator::from_config(cfg),
            Err(PipelineError::Config(_))
        ));
    }
}
