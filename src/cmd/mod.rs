mod batch;
mod load;
mod run;
mod transform;
mod verify;

use clap::{Args, Parser, Subcommand};
use dumpshift::config::PipelineConfig;
use dumpshift::executor::postgres::PgDestination;
use dumpshift::executor::{LoadTarget, Offline};
use dumpshift::logging::LogFormat;
use dumpshift::parser::TruncationPolicy;
use dumpshift::pipeline::{Pipeline, RunContext};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "dumpshift")]
#[command(version)]
#[command(
    about = "Rewrite PostgreSQL dumps and replay them into another environment, never touching protected tables",
    long_about = None
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_format(&self) -> anyhow::Result<LogFormat> {
        self.log_format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!("{}", e))
    }
}

/// Flags shared by the single-file commands
#[derive(Args, Debug, Clone, Default)]
pub struct PassArgs {
    /// Source database the dump came from (enables the transient-prefix rule)
    #[arg(long)]
    pub source_db: Option<String>,

    /// Target database name (replaces the source name in schema statements)
    #[arg(long)]
    pub target_db: Option<String>,

    /// Rows per generated INSERT
    #[arg(long)]
    pub insert_width: Option<usize>,

    /// Statements per execution batch (auto when unset)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Send nothing to the destination; report estimates instead
    #[arg(long)]
    pub dry_run: bool,

    /// End-of-input handling for an unterminated statement: repair or error
    #[arg(long)]
    pub on_truncated: Option<String>,

    /// Show a progress bar while rewriting
    #[arg(short, long)]
    pub progress: bool,

    /// Print statistics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rewrite a dump: COPY blocks to INSERT batches, protected tables excluded
    Transform {
        /// Plain-SQL dump file
        input: PathBuf,

        /// Rewritten output file
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        args: PassArgs,
    },

    /// Scan a rewritten file for operations on protected tables
    Verify {
        /// Rewritten SQL file
        file: PathBuf,

        /// Source database the dump came from (enables the transient-prefix rule)
        #[arg(long)]
        source_db: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a rewritten file into a destination database in FK order
    Load {
        /// Rewritten SQL file
        file: PathBuf,

        /// Destination database (defaults to --target-db, then --source-db)
        #[arg(short, long)]
        database: Option<String>,

        /// Connection string without database name (overrides the config file)
        #[arg(long)]
        destination: Option<String>,

        #[command(flatten)]
        args: PassArgs,
    },

    /// Transform, verify and load in one pass
    Run {
        /// Plain-SQL dump file
        input: PathBuf,

        /// Rewritten output file
        #[arg(short, long)]
        output: PathBuf,

        /// Destination database (defaults to --target-db, then --source-db)
        #[arg(short, long)]
        database: Option<String>,

        /// Connection string without database name (overrides the config file)
        #[arg(long)]
        destination: Option<String>,

        #[command(flatten)]
        args: PassArgs,
    },

    /// Process every database listed in the config file
    Batch {
        /// Databases processed at once (overrides the config file)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Send nothing to the destinations
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Transform {
            input,
            output,
            args,
        } => transform::run(config, input, output, args).await,
        Commands::Verify {
            file,
            source_db,
            json,
        } => verify::run(config, file, source_db, json).await,
        Commands::Load {
            file,
            database,
            destination,
            args,
        } => load::run(config, file, database, destination, args).await,
        Commands::Run {
            input,
            output,
            database,
            destination,
            args,
        } => run::run(config, input, output, database, destination, args).await,
        Commands::Batch {
            concurrency,
            dry_run,
            json,
        } => batch::run(config, concurrency, dry_run, json).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::load(p)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", p.display(), e)),
        None => Ok(PipelineConfig::default()),
    }
}

/// Apply command-line overrides on top of the file configuration.
fn apply_overrides(
    mut config: PipelineConfig,
    args: &PassArgs,
) -> anyhow::Result<PipelineConfig> {
    if let Some(w) = args.insert_width {
        config.rewrite.insert_batch_width = w;
    }
    if let Some(b) = args.batch_size {
        config.execution.batch_size = Some(b);
    }
    if args.dry_run {
        config.execution.dry_run = true;
    }
    if let Some(policy) = &args.on_truncated {
        config.rewrite.on_truncated_input = policy
            .parse::<TruncationPolicy>()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
    }
    config.validate()?;
    Ok(config)
}

fn pipeline_for(config: PipelineConfig, args: &PassArgs) -> Pipeline {
    let context = RunContext::new(args.source_db.clone(), args.target_db.clone());
    Pipeline::new(config, context)
}

/// Byte progress bar for the rewrite phase
fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}",
        )
        .unwrap()
        .progress_chars("█▓▒░  ")
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Attach a progress bar to `pipeline` when requested.
fn with_progress(
    pipeline: Pipeline,
    input: &Path,
    args: &PassArgs,
) -> (Pipeline, Option<ProgressBar>) {
    if !args.progress || args.json {
        return (pipeline, None);
    }
    let total = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    let pb = progress_bar(total);
    let bar = pb.clone();
    (pipeline.with_byte_progress(move |pos| bar.set_position(pos)), Some(pb))
}

/// Open the destination for a load, or [`Offline`] for a dry run without one.
async fn open_destination(
    config: &PipelineConfig,
    database: Option<String>,
    destination: Option<String>,
    args: &PassArgs,
) -> anyhow::Result<Box<dyn LoadTarget>> {
    let connection = destination.or_else(|| config.destination.clone());
    let database = database
        .or_else(|| args.target_db.clone())
        .or_else(|| args.source_db.clone());

    match (connection, database) {
        (Some(conn), Some(db)) => Ok(Box::new(PgDestination::connect(&conn, &db).await?)),
        _ if config.execution.dry_run => Ok(Box::new(Offline)),
        (None, _) => anyhow::bail!(
            "no destination: pass --destination or set `destination` in the config file"
        ),
        (Some(_), None) => anyhow::bail!("no database: pass --database or --target-db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_file_config() {
        let args = PassArgs {
            insert_width: Some(10),
            batch_size: Some(7),
            dry_run: true,
            on_truncated: Some("error".into()),
            ..Default::default()
        };
        let config = apply_overrides(PipelineConfig::default(), &args).unwrap();
        assert_eq!(config.rewrite.insert_batch_width, 10);
        assert_eq!(config.execution.batch_size, Some(7));
        assert!(config.execution.dry_run);
        assert_eq!(config.rewrite.on_truncated_input, TruncationPolicy::Error);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = PassArgs {
            insert_width: Some(0),
            ..Default::default()
        };
        assert!(apply_overrides(PipelineConfig::default(), &args).is_err());

        let args = PassArgs {
            on_truncated: Some("ignore".into()),
            ..Default::default()
        };
        assert!(apply_overrides(PipelineConfig::default(), &args).is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "dumpshift",
            "run",
            "dump.sql",
            "-o",
            "out.sql",
            "--source-db",
            "ffc-doc-statement-data-test",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { args, database, .. } => {
                assert!(args.dry_run);
                assert_eq!(args.source_db.as_deref(), Some("ffc-doc-statement-data-test"));
                assert!(database.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_without_destination_is_offline() {
        let mut config = PipelineConfig::default();
        config.execution.dry_run = true;
        let dest = open_destination(&config, None, None, &PassArgs::default()).await;
        assert!(dest.is_ok());

        config.execution.dry_run = false;
        let dest = open_destination(&config, Some("db".into()), None, &PassArgs::default()).await;
        assert!(dest.is_err());
    }
}
