//! Append-only log of failed statements, next to the executed file.

use super::result::StatementFailure;
use crate::error::Result;
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// `<sql file>.errors.log`
pub fn error_log_path(sql_file: &Path) -> PathBuf {
    let mut name = sql_file.as_os_str().to_os_string();
    name.push(".errors.log");
    PathBuf::from(name)
}

/// Lazily created error log; nothing is written for clean runs.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    file: Option<File>,
    entries: u64,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            entries: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub async fn append(&mut self, failure: &StatementFailure) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }

        let entry = format_entry(failure, &Local::now().to_rfc3339());
        if let Some(file) = self.file.as_mut() {
            file.write_all(entry.as_bytes()).await?;
        }
        self.entries += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

fn format_entry(failure: &StatementFailure, timestamp: &str) -> String {
    let table = failure.table.as_deref().unwrap_or("-");
    format!(
        "[{}] ERROR in SQL statement ({} on {}): {}\nStatement: {}\n\n",
        timestamp, failure.kind, table, failure.message, failure.statement
    )
}
