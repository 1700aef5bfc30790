//! Error types for the dump pipeline.
//!
//! Only conditions that must stop a database's run are errors. Per-statement
//! execution failures are recorded in [`crate::executor::BatchResult`] instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration error (invalid YAML, out-of-range values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input ended inside a statement and the truncation policy is `error`
    #[error("Input ended inside an unterminated statement at byte {offset}: {preview}")]
    TruncatedInput { offset: u64, preview: String },

    /// Verification scan found operations against protected tables in rewritten output
    #[error(
        "CRITICAL SAFETY ERROR: found {count} unfiltered operation(s) against protected tables in {}",
        path.display()
    )]
    ProtectionViolation {
        path: PathBuf,
        count: usize,
        examples: Vec<String>,
    },

    /// Destination unreachable or connection lost mid-run
    #[error("Destination connection error: {0}")]
    Connection(String),

    /// A phase exceeded its wall-clock ceiling
    #[error("{phase} timed out after {}s", limit.as_secs())]
    Timeout { phase: String, limit: Duration },

    /// Dump provider could not produce a dump file
    #[error("Dump failed for database {database}: {message}")]
    Dump { database: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a Timeout error for a named phase
    pub fn timeout(phase: impl Into<String>, limit: Duration) -> Self {
        PipelineError::Timeout {
            phase: phase.into(),
            limit,
        }
    }

    /// Create a Dump error
    pub fn dump(database: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Dump {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from the safety verification scan.
    pub fn is_protection_violation(&self) -> bool {
        matches!(self, PipelineError::ProtectionViolation { .. })
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        if let PipelineError::ProtectionViolation { examples, .. } = self {
            for line in examples {
                output.push_str(&format!("  {}\n", line));
            }
        }

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
