//! Run command CLI handler: transform, verify and load.

use super::{apply_overrides, open_destination, pipeline_for, with_progress, PassArgs};
use dumpshift::config::PipelineConfig;
use std::path::PathBuf;
use std::time::Instant;

pub async fn run(
    config: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
    database: Option<String>,
    destination: Option<String>,
    args: PassArgs,
) -> anyhow::Result<()> {
    if !input.exists() {
        anyhow::bail!("input file does not exist: {}", input.display());
    }
    let config = apply_overrides(config, &args)?;
    let (pipeline, pb) = with_progress(pipeline_for(config, &args), &input, &args);
    let started = Instant::now();

    // Rewrite and verify before opening any connection.
    let prepared = pipeline.prepare(&input, &output).await;
    if let Some(pb) = pb {
        pb.finish_with_message("rewritten");
    }
    let mut stats = prepared?;

    let mut target = open_destination(pipeline.config(), database, destination, &args).await?;
    let execution = pipeline.load(&output, target.as_mut()).await?;
    stats.attach_execution(execution, started);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("\n{}", stats);
    }

    if stats.has_errors() {
        let count = stats.execution.as_ref().map(|e| e.error_count).unwrap_or(0);
        anyhow::bail!("{} statement(s) failed during load", count);
    }
    Ok(())
}
