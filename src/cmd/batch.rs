//! Batch command CLI handler: every database in the config file.

use dumpshift::config::PipelineConfig;
use dumpshift::orchestrator::Orchestrator;

pub async fn run(
    mut config: PipelineConfig,
    concurrency: Option<usize>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(c) = concurrency {
        config.concurrency = c;
    }
    if dry_run {
        config.execution.dry_run = true;
    }
    if config.databases.is_empty() {
        anyhow::bail!("no databases configured; add a `databases` list to the config file");
    }

    let orchestrator = Orchestrator::from_config(config)?;
    let summary = orchestrator.run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for outcome in &summary.outcomes {
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("{} → {}", outcome.source, outcome.target);
            match (&outcome.statistics, &outcome.error) {
                (Some(stats), _) => println!("{}", stats),
                (None, Some(err)) if outcome.protection_violation => {
                    println!("  ✗ CRITICAL: {}", err)
                }
                (None, Some(err)) => println!("  ✗ {}", err),
                (None, None) => {}
            }
        }
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Batch Summary:");
        println!("  Databases: {}", summary.outcomes.len());
        println!("  Succeeded: {}", summary.succeeded());
        println!("  Failed: {}", summary.failed());
        println!("  Elapsed: {:.1}s", summary.elapsed_secs);
    }

    if summary.has_failures() {
        anyhow::bail!(
            "{} of {} database(s) failed or had statement errors",
            summary.unhealthy(),
            summary.outcomes.len()
        );
    }
    Ok(())
}
