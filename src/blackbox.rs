//! Blackbox audit log for unrecoverable bet failures.
//!
//! When the outcome of a submitted bet is unknown (timeout, ambiguous page
//! state after the irreversible click), no automatic refund may happen. The
//! full context is written here instead, durably, for manual reconciliation.
//! A record is flushed and synced before the failure surfaces anywhere else.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

use crate::models::BetSignal;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboxRecord {
    pub recorded_at: DateTime<Utc>,
    pub tx_id: Option<String>,
    pub signal: BetSignal,
    pub stake: Option<f64>,
    pub odds: Option<f64>,
    pub ledger_balance: Option<f64>,
    pub external_balance: Option<f64>,
    pub error: String,
}

#[derive(Clone)]
pub struct Blackbox {
    path: PathBuf,
}

impl Blackbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one JSON line. Failure to write is itself critical: it is
    /// logged loudly and propagated so the caller can escalate.
    pub fn record(&self, record: &BlackboxRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let line = serde_json::to_string(record).context("serialize blackbox record")?;
        let result = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("open blackbox {}", self.path.display()))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            file.sync_data().context("sync blackbox")?;
            Ok(())
        })();

        if let Err(err) = &result {
            error!(error = %err, tx_id = ?record.tx_id, "FAILED TO PERSIST BLACKBOX RECORD");
        }
        result
    }

    /// All records, oldest first. Unparsable lines are skipped.
    pub fn load(&self) -> Result<Vec<BlackboxRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
