//! Transform command CLI handler.

use super::{apply_overrides, pipeline_for, with_progress, PassArgs};
use dumpshift::config::PipelineConfig;
use std::path::PathBuf;
use std::time::Instant;

pub async fn run(
    config: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
    args: PassArgs,
) -> anyhow::Result<()> {
    if !input.exists() {
        anyhow::bail!("input file does not exist: {}", input.display());
    }
    let config = apply_overrides(config, &args)?;
    let (pipeline, pb) = with_progress(pipeline_for(config, &args), &input, &args);

    let start_time = Instant::now();
    let result = pipeline.transform_file(&input, &output).await;
    if let Some(pb) = pb {
        pb.finish_with_message("done");
    }
    let stats = result?;
    let elapsed = start_time.elapsed();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\n✓ Rewrite completed: {}", output.display());
    println!("\nStatistics:");
    println!("  Lines read: {}", stats.lines);
    println!("  Statements: {}", stats.statements);
    println!(
        "  COPY blocks converted: {} ({} rows → {} INSERTs)",
        stats.copy_blocks, stats.copy_rows, stats.inserts_generated
    );
    println!("  Protected statements excluded: {}", stats.protected_total());
    println!("  Database commands skipped: {}", stats.database_commands_skipped);
    println!("  Constraints skipped: {}", stats.constraints_skipped);
    println!("  Elapsed time: {:.3?}", elapsed);

    if elapsed.as_secs_f64() > 0.0 {
        let throughput = stats.bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
        println!("  Throughput: {:.2} MB/s", throughput);
    }

    if stats.warning_count > 0 {
        println!();
        println!("Warnings ({}):", stats.warning_count);
        for warning in &stats.warnings {
            println!("  ⚠ {}", warning);
        }
    }

    Ok(())
}
