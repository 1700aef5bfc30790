//! Verify command CLI handler.

use dumpshift::config::PipelineConfig;
use dumpshift::error::PipelineError;
use dumpshift::protect::{verify_file, ProtectionRules};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct VerifyJsonOutput {
    file: String,
    passed: bool,
    lines_scanned: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    violations: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    examples: Vec<String>,
}

pub async fn run(
    config: PipelineConfig,
    file: PathBuf,
    source_db: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("file does not exist: {}", file.display());
    }
    let rules = ProtectionRules::for_source(&config.protection, source_db.as_deref());

    match verify_file(&file, &rules).await {
        Ok(report) => {
            if json {
                let out = VerifyJsonOutput {
                    file: file.display().to_string(),
                    passed: true,
                    lines_scanned: report.lines_scanned,
                    violations: None,
                    examples: Vec::new(),
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "✓ {}: {} lines scanned, no operations on protected tables",
                    file.display(),
                    report.lines_scanned
                );
            }
            Ok(())
        }
        Err(PipelineError::ProtectionViolation {
            path,
            count,
            examples,
        }) => {
            if json {
                let out = VerifyJsonOutput {
                    file: path.display().to_string(),
                    passed: false,
                    lines_scanned: 0,
                    violations: Some(count),
                    examples,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                eprintln!("✗ {} protected-table operation(s) found:", count);
                for line in &examples {
                    eprintln!("  {}", line);
                }
            }
            anyhow::bail!("verification failed for {}", path.display())
        }
        Err(e) => Err(e.into()),
    }
}
