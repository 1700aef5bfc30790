//! Load command CLI handler.

use super::{apply_overrides, open_destination, pipeline_for, PassArgs};
use dumpshift::config::PipelineConfig;
use dumpshift::executor::error_log_path;
use std::path::PathBuf;

pub async fn run(
    config: PipelineConfig,
    file: PathBuf,
    database: Option<String>,
    destination: Option<String>,
    args: PassArgs,
) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("file does not exist: {}", file.display());
    }
    let config = apply_overrides(config, &args)?;
    let mut target = open_destination(&config, database, destination, &args).await?;
    let pipeline = pipeline_for(config, &args);

    let stats = pipeline.load(&file, target.as_mut()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("\n{} load finished:", if stats.dry_run { "Dry-run" } else { "✓" });
        println!("  Statements planned: {}", stats.statements_planned);
        println!("  Executed: {}", stats.success_count);
        println!("  Errored: {}", stats.error_count);
        println!("  Skipped: {}", stats.skipped_count);
        if stats.dry_run {
            println!("  Estimated rows: {}", stats.estimated_rows);
        } else {
            println!("  Rows affected: {}", stats.rows_affected);
        }
        for failure in &stats.failures {
            println!(
                "  ✗ {} on {}: {}",
                failure.kind,
                failure.table.as_deref().unwrap_or("-"),
                failure.message
            );
        }
    }

    if stats.has_errors() {
        anyhow::bail!(
            "{} statement(s) failed; see {}",
            stats.error_count,
            error_log_path(&file).display()
        );
    }
    Ok(())
}
