//! Durable selector map with rotating backups and healing history.
//!
//! The selector file is human-editable JSON. Every overwrite first copies the
//! current file into the backup directory with a timestamp suffix (oldest
//! backups pruned beyond the configured count), then rewrites atomically via
//! a temp file + rename. The healing history is a bounded JSON log persisted
//! on every mutation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::SelectorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRecord {
    pub at: DateTime<Utc>,
    pub key: String,
    pub old_selector: Option<String>,
    pub new_selector: String,
    pub tier: String,
}

pub struct SelectorStore {
    cfg: SelectorConfig,
    map: RwLock<HashMap<String, String>>,
    history: RwLock<Vec<HealingRecord>>,
}

impl SelectorStore {
    pub fn load(cfg: SelectorConfig) -> Result<Self> {
        let map = if cfg.path.exists() {
            let raw = std::fs::read_to_string(&cfg.path)
                .with_context(|| format!("read selector map {}", cfg.path.display()))?;
            serde_json::from_str(&raw).context("parse selector map")?
        } else {
            HashMap::new()
        };

        let history = if cfg.history_path.exists() {
            std::fs::read_to_string(&cfg.history_path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Self {
            cfg,
            map: RwLock::new(map),
            history: RwLock::new(history),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    /// Record a healed selector: rotate backups, rewrite the map atomically,
    /// append to the bounded history.
    pub fn persist_heal(&self, key: &str, selector: &str, tier: &str) -> Result<()> {
        let old = {
            let mut map = self.map.write();
            map.insert(key.to_string(), selector.to_string())
        };

        self.rotate_backups()?;
        self.write_map()?;
        self.append_history(HealingRecord {
            at: Utc::now(),
            key: key.to_string(),
            old_selector: old,
            new_selector: selector.to_string(),
            tier: tier.to_string(),
        })?;

        info!(key, selector, tier, "selector healed and persisted");
        Ok(())
    }

    pub fn history(&self) -> Vec<HealingRecord> {
        self.history.read().clone()
    }

    fn rotate_backups(&self) -> Result<()> {
        if !self.cfg.path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.cfg.backup_dir)?;

        let stem = self
            .cfg
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("selectors.json");
        let backup_name = format!("{stem}.{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        std::fs::copy(&self.cfg.path, self.cfg.backup_dir.join(&backup_name))
            .context("copy selector backup")?;

        // Prune oldest beyond the keep count.
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.cfg.backup_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(stem))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > self.cfg.backup_keep {
            let oldest = backups.remove(0);
            if let Err(err) = std::fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %err, "failed to prune selector backup");
            }
        }
        Ok(())
    }

    fn write_map(&self) -> Result<()> {
        let snapshot = self.map.read().clone();
        write_json_atomic(&self.cfg.path, &snapshot)
    }

    fn append_history(&self, record: HealingRecord) -> Result<()> {
        let snapshot = {
            let mut history = self.history.write();
            history.push(record);
            let excess = history.len().saturating_sub(self.cfg.history_keep);
            if excess > 0 {
                history.drain(..excess);
            }
            history.clone()
        };
        write_json_atomic(&self.cfg.history_path, &snapshot)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
