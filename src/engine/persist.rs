//! Usage snapshot persistence.
//!
//! The snapshot file is a JSON map keyed `"<model>_<key>"`. On load the
//! configured (model, key) domain is the source of truth: entries for keys
//! or models no longer configured are dropped, missing cells start at zero,
//! and the reconciled file is written back immediately. The transient
//! `just_hit_429` flag is never persisted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::engine::ledger::{UsageCell, UsageRecord};
use crate::engine::{CellKey, Engine};

/// Autosave cadence.
pub const AUTOSAVE_TICK: Duration = Duration::from_secs(60);

/// Minimum spacing between two snapshot writes.
pub const SAVE_FLOOR: Duration = Duration::from_secs(10);

/// Errors from reading or writing the usage snapshot file.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode usage snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialized form of one usage cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedCell {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub today_usage: u64,
    #[serde(default)]
    pub past_24hrs_usage_data: Vec<UsageRecord>,
    #[serde(default)]
    pub probably_exceeded: bool,
    #[serde(default)]
    pub exceeded: bool,
}

impl From<&UsageCell> for PersistedCell {
    fn from(cell: &UsageCell) -> Self {
        Self {
            total_tokens: cell.total_tokens,
            today_usage: cell.today_tokens,
            past_24hrs_usage_data: cell.history_24h.clone(),
            probably_exceeded: cell.probably_exceeded,
            exceeded: cell.exceeded,
        }
    }
}

impl PersistedCell {
    fn into_cell(self) -> UsageCell {
        UsageCell {
            total_tokens: self.total_tokens,
            today_tokens: self.today_usage,
            history_24h: self.past_24hrs_usage_data,
            window_60s: Vec::new(),
            probably_exceeded: self.probably_exceeded,
            exceeded: self.exceeded,
            just_hit_429: false,
        }
    }
}

/// File map key for a (model, key) pair.
pub fn file_key(model: &str, key: &str) -> String {
    format!("{}_{}", model, key)
}

/// Load the usage snapshot, reconciled against the configured domain, and
/// write the cleaned file back.
pub fn load_usage(
    path: &Path,
    config: &ProxyConfig,
) -> Result<HashMap<CellKey, UsageCell>, PersistError> {
    let mut old: HashMap<String, PersistedCell> = HashMap::new();
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => {
            match serde_json::from_str(&content) {
                Ok(parsed) => old = parsed,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse usage file, reinitializing");
                }
            }
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut cells = HashMap::new();
    for model in config.models.keys() {
        for key in config.all_keys() {
            let cell = old
                .remove(&file_key(model, key))
                .map(PersistedCell::into_cell)
                .unwrap_or_default();
            cells.insert(
                CellKey {
                    model: model.clone(),
                    key: key.clone(),
                },
                cell,
            );
        }
    }

    if !old.is_empty() {
        tracing::info!(
            dropped = old.len(),
            "Dropped usage entries no longer in configuration"
        );
    }

    save_usage(path, cells.iter().map(|(k, c)| (k, c)))?;
    Ok(cells)
}

/// Write the usage snapshot file (pretty-printed JSON).
pub fn save_usage<'a>(
    path: &Path,
    cells: impl Iterator<Item = (&'a CellKey, &'a UsageCell)>,
) -> Result<(), PersistError> {
    let map: HashMap<String, PersistedCell> = cells
        .map(|(k, cell)| (file_key(&k.model, &k.key), PersistedCell::from(cell)))
        .collect();
    let content = serde_json::to_string_pretty(&map)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Background task that periodically flushes the ledger to disk.
pub struct Autosaver {
    engine: Arc<Engine>,
}

impl Autosaver {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Start the autosave loop. A final forced flush happens in the serve
    /// path after shutdown, not here.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUTOSAVE_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!("Usage autosave started");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Usage autosave shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.engine.save_usage(false);
                    }
                }
            }
        })
    }
}
