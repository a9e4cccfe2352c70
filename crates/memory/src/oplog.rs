//! Append-only audit trail of every attempted mutating operation.
//!
//! One JSON object per line in `logs/operations.log`. Appends are
//! serialised by a single process-wide lock and fsynced so a record
//! survives a crash immediately after the call returns. The engine never
//! truncates this file.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{MemoryError, Result};
use crate::schema::OperationRecord;

#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &OperationRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush userspace buffers and fsync so the record survives a
        // process crash or power loss immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Last `n` parseable records, oldest first. Corrupt lines are skipped
    /// with a warning — the log is for recovery, so one bad line must not
    /// poison the rest.
    pub fn tail(&self, n: usize) -> Result<Vec<OperationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|err| MemoryError::DataStore(err.to_string()))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut corrupt = 0usize;
        for (line_idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| MemoryError::DataStore(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OperationRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    corrupt += 1;
                    warn!(
                        line = line_idx + 1,
                        %err,
                        path = %self.path.display(),
                        "corrupt operation record — skipping line"
                    );
                }
            }
        }
        if corrupt > 0 {
            warn!(
                corrupt_lines = corrupt,
                path = %self.path.display(),
                "operation log read with skipped corrupt lines"
            );
        }

        if records.len() > n {
            records.drain(..records.len() - n);
        }
        Ok(records)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
