//! YAML configuration for pipeline runs.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! CLI flags override file values after loading.

use crate::error::{PipelineError, Result};
use crate::parser::TruncationPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Databases known to carry ETL staging tables
pub const DEFAULT_TRANSIENT_DATABASES: [&str; 2] =
    ["ffc-doc-statement-data-test", "ffc-doc-statement-data-dev"];

/// Migration bookkeeping tables, never touched
pub const DEFAULT_FIXED_TABLES: [&str; 2] = ["databasechangelog", "databasechangeloglock"];

/// Protected-table rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Name prefix of transient staging tables
    pub transient_prefix: String,
    /// Source databases in which the prefix rule is enforced
    pub transient_databases: Vec<String>,
    /// Tables protected regardless of source database
    pub fixed_tables: Vec<String>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            transient_prefix: "etl".to_string(),
            transient_databases: DEFAULT_TRANSIENT_DATABASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fixed_tables: DEFAULT_FIXED_TABLES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Dump rewriting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Maximum rows per generated INSERT
    pub insert_batch_width: usize,
    /// Drop database commands, comment out constraints, add IF NOT EXISTS
    pub relax_schema: bool,
    /// Wrap output in `SET session_replication_role = replica` / `DEFAULT`
    pub disable_triggers: bool,
    /// What to do with an unterminated statement at end of input
    pub on_truncated_input: TruncationPolicy,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            insert_batch_width: crate::convert::DEFAULT_INSERT_BATCH_WIDTH,
            relax_schema: true,
            disable_triggers: true,
            on_truncated_input: TruncationPolicy::Repair,
        }
    }
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Statements per batch; chosen from file size when unset
    pub batch_size: Option<usize>,
    pub dry_run: bool,
    /// Skip CREATE/ALTER/DROP when loading
    pub data_only: bool,
    /// One transaction per batch, savepoint per statement
    pub atomic_batches: bool,
    /// Record progress in `<file>.checkpoint.json` and resume from it
    pub checkpoint: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            dry_run: false,
            data_only: true,
            atomic_batches: false,
            checkpoint: false,
        }
    }
}

/// Heartbeat and stall reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub heartbeat_secs: u64,
    pub stall_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            stall_secs: 30,
        }
    }
}

impl ProgressConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_secs(self.stall_secs)
    }
}

/// Wall-clock ceilings per phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dump_secs: u64,
    pub transform_secs: u64,
    pub load_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dump_secs: 30 * 60,
            transform_secs: 30 * 60,
            load_secs: 2 * 60 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn dump(&self) -> Duration {
        Duration::from_secs(self.dump_secs)
    }

    pub fn transform(&self) -> Duration {
        Duration::from_secs(self.transform_secs)
    }

    pub fn load(&self) -> Duration {
        Duration::from_secs(self.load_secs)
    }
}

/// One source database copied into one target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseJob {
    pub source: String,
    /// Defaults to the source name
    #[serde(default)]
    pub target: Option<String>,
}

impl DatabaseJob {
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// Complete YAML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub protection: ProtectionConfig,
    pub rewrite: RewriteConfig,
    pub execution: ExecutionConfig,
    pub progress: ProgressConfig,
    pub timeouts: TimeoutConfig,
    /// Databases processed at once in batch runs
    pub concurrency: usize,
    /// libpq-style connection string without a database name
    pub destination: Option<String>,
    pub databases: Vec<DatabaseJob>,
    /// Directory holding `<source>.sql` dumps
    pub dump_dir: Option<PathBuf>,
    /// Directory for rewritten output; defaults to `dump_dir`
    pub output_dir: Option<PathBuf>,
    /// `table -> column -> replacement`; null replaces with NULL
    pub scrub: HashMap<String, HashMap<String, Option<String>>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            protection: ProtectionConfig::default(),
            rewrite: RewriteConfig::default(),
            execution: ExecutionConfig::default(),
            progress: ProgressConfig::default(),
            timeouts: TimeoutConfig::default(),
            concurrency: 2,
            destination: None,
            databases: Vec::new(),
            dump_dir: None,
            output_dir: None,
            scrub: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: PipelineConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rewrite.insert_batch_width == 0 {
            return Err(PipelineError::Config(
                "rewrite.insert_batch_width must be at least 1".into(),
            ));
        }
        if self.execution.batch_size == Some(0) {
            return Err(PipelineError::Config(
                "execution.batch_size must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        if self.protection.transient_prefix.trim().is_empty() {
            return Err(PipelineError::Config(
                "protection.transient_prefix must not be empty".into(),
            ));
        }
        if self.progress.heartbeat_secs == 0 {
            return Err(PipelineError::Config(
                "progress.heartbeat_secs must be at least 1".into(),
            ));
        }
        for (name, secs) in [
            ("timeouts.dump_secs", self.timeouts.dump_secs),
            ("timeouts.transform_secs", self.timeouts.transform_secs),
            ("timeouts.load_secs", self.timeouts.load_secs),
        ] {
            if secs == 0 {
                return Err(PipelineError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}
