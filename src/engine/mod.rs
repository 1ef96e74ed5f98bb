//! Key Selection & Rate-Budget Engine.
//!
//! The engine owns every per-(model, key) usage cell behind a single mutex.
//! All public methods take that lock exclusively at the top level; internal
//! helpers only ever operate on already-borrowed state, so the non-re-entrant
//! `std::sync::Mutex` is safe here. The pre-call delay is returned as a value
//! and slept on by the caller, never inside the lock.
//!
//! Lock order where the minute-series mutex is also needed: engine first,
//! then series (see `history.rs`).

pub mod budget;
pub mod error;
pub mod history;
pub mod ledger;
pub mod persist;
pub mod registry;
pub mod reset;
pub mod snapshot;

pub use budget::{Availability, DAILY_HARD_CAP_TOKENS};
pub use error::EngineError;
pub use history::{HistoryAggregator, SeriesStore};
pub use ledger::{UsageCell, UsageRecord};
pub use persist::Autosaver;
pub use registry::{KeyClass, KeyInfo, KeyRegistry};
pub use reset::ResetScheduler;
pub use snapshot::StatusSnapshot;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, ModelConfig, ProxyConfig, RESET_DATETIME_FORMAT};

/// Identity of one usage cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub model: String,
    pub key: String,
}

/// Result of a key selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// The chosen API key
    pub key: String,
    /// The resolved model name (the default model when the requested one
    /// is not configured)
    pub model: String,
    /// Throttle delay the caller must sleep before forwarding
    pub delay: Duration,
}

/// Mutable engine state guarded by the engine mutex.
pub(crate) struct EngineState {
    pub(crate) cells: HashMap<CellKey, UsageCell>,
    pub(crate) next_reset: DateTime<Utc>,
    pub(crate) last_saved: Option<Instant>,
}

/// The key-selection and rate-budget engine.
pub struct Engine {
    pub(crate) models: HashMap<String, ModelConfig>,
    pub(crate) default_model: String,
    pub(crate) registry: KeyRegistry,
    pub(crate) tz: Tz,
    pub(crate) reset_after: NaiveTime,
    pub(crate) usage_path: PathBuf,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) series: SeriesStore,
}

impl Engine {
    /// Build the engine from configuration, loading (and reconciling) the
    /// usage snapshot file.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let tz = config.parsed_timezone()?;
        let reset_after = config.parsed_reset_after()?;
        let next_reset = config.parsed_next_reset()?.with_timezone(&Utc);

        let cells = persist::load_usage(&config.usage_file, config).map_err(|e| match e {
            persist::PersistError::Io(io) => ConfigError::Io(io),
            persist::PersistError::Encode(err) => ConfigError::Parse(err.to_string()),
        })?;

        Ok(Self {
            models: config.models.clone(),
            default_model: config.default_model.clone(),
            registry: KeyRegistry::new(&config.priority_keys, &config.secondary_keys),
            tz,
            reset_after,
            usage_path: config.usage_file.clone(),
            state: Mutex::new(EngineState {
                cells,
                next_reset,
                last_saved: None,
            }),
            series: SeriesStore::new(),
        })
    }

    fn now_ts() -> i64 {
        Utc::now().timestamp()
    }

    /// Resolve a requested model to a configured one, substituting the
    /// default model for unknown names.
    pub fn resolve_model(&self, model_name: &str) -> String {
        if self.models.contains_key(model_name) {
            model_name.to_string()
        } else {
            tracing::info!(
                requested = model_name,
                default = %self.default_model,
                "Model not configured, falling back to default model"
            );
            self.default_model.clone()
        }
    }

    /// Choose the key to serve a request for `model_name`.
    ///
    /// One atomic pass over the registry in canonical order: fully available
    /// keys are preferred, soft-disabled (`probably_exceeded`) keys serve as
    /// fallback, hard-disabled keys are skipped. The first candidate wins so
    /// selection stays sticky while budgets allow.
    pub fn select_key(&self, model_name: &str) -> Result<Selection, EngineError> {
        let model_name = self.resolve_model(model_name);
        let model = self.models[&model_name].clone();
        let now = Self::now_ts();

        let mut state = self.state.lock().unwrap();

        let mut primary: Vec<String> = Vec::new();
        let mut fallback: Vec<String> = Vec::new();

        for key_info in self.registry.iter() {
            let cell_key = CellKey {
                model: model_name.clone(),
                key: key_info.key.clone(),
            };
            let Some(cell) = state.cells.get_mut(&cell_key) else {
                tracing::warn!(
                    model = %model_name,
                    key_prefix = %prefix(&key_info.key),
                    "Usage cell missing, skipping key"
                );
                continue;
            };

            cell.touch(now);
            let was_exceeded = cell.exceeded;
            match budget::classify(cell, &model) {
                Availability::Unavailable => {
                    if !was_exceeded && cell.exceeded {
                        tracing::info!(
                            model = %model_name,
                            key_prefix = %prefix(&key_info.key),
                            today_tokens = cell.today_tokens,
                            "Key hit its daily budget, marked exceeded"
                        );
                    }
                }
                Availability::Available => primary.push(key_info.key.clone()),
                Availability::Degraded => fallback.push(key_info.key.clone()),
            }
        }

        let candidates = if !primary.is_empty() {
            primary
        } else if !fallback.is_empty() {
            fallback
        } else {
            return Err(EngineError::NoKeyAvailable { model: model_name });
        };

        let key = candidates[0].clone();
        let cell = &state.cells[&CellKey {
            model: model_name.clone(),
            key: key.clone(),
        }];
        let delay = budget::pre_call_delay(cell, &model);

        if !delay.is_zero() {
            tracing::debug!(
                model = %model_name,
                key_prefix = %prefix(&key),
                delay_ms = delay.as_millis() as u64,
                "Throttle delay imposed before forwarding"
            );
        }

        Ok(Selection {
            key,
            model: model_name,
            delay,
        })
    }

    /// Read-only selection used by the status snapshot: same walk as
    /// [`Engine::select_key`] but operating on cell copies, so no flags or
    /// windows are mutated.
    pub fn peek_key(&self, model_name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        self.peek_key_in(&state, model_name)
    }

    /// [`Engine::peek_key`] body for callers already holding the engine
    /// mutex.
    pub(crate) fn peek_key_in(&self, state: &EngineState, model_name: &str) -> Option<String> {
        let model_name = if self.models.contains_key(model_name) {
            model_name.to_string()
        } else {
            self.default_model.clone()
        };
        let model = self.models.get(&model_name)?.clone();
        let now = Self::now_ts();

        let mut fallback: Option<String> = None;
        for key_info in self.registry.iter() {
            let cell_key = CellKey {
                model: model_name.clone(),
                key: key_info.key.clone(),
            };
            let Some(cell) = state.cells.get(&cell_key) else {
                continue;
            };
            let mut scratch = cell.clone();
            scratch.touch(now);
            match budget::classify(&mut scratch, &model) {
                Availability::Unavailable => {}
                Availability::Available => return Some(key_info.key.clone()),
                Availability::Degraded => {
                    fallback.get_or_insert_with(|| key_info.key.clone());
                }
            }
        }
        fallback
    }

    /// Record the token cost of a successful upstream call.
    pub fn record_usage(&self, model_name: &str, key: &str, tokens: u64) {
        let now = Self::now_ts();
        let mut state = self.state.lock().unwrap();
        let cell_key = CellKey {
            model: model_name.to_string(),
            key: key.to_string(),
        };
        let Some(cell) = state.cells.get_mut(&cell_key) else {
            tracing::warn!(
                model = model_name,
                key_prefix = %prefix(key),
                "RecordUsage for unknown cell, ignoring"
            );
            return;
        };
        cell.append(now, tokens);
    }

    /// Two-strike 429 handling.
    ///
    /// Over the daily hard cap a 429 means the quota really is gone; the key
    /// is hard-disabled. Otherwise the first strike arms the throttle delay
    /// and the second strike (a 429 that arrived even after the delay)
    /// soft-disables the key.
    pub fn handle_rate_limit(&self, model_name: &str, key: &str) {
        let now = Self::now_ts();
        let mut state = self.state.lock().unwrap();
        let cell_key = CellKey {
            model: model_name.to_string(),
            key: key.to_string(),
        };
        let Some(cell) = state.cells.get_mut(&cell_key) else {
            tracing::warn!(
                model = model_name,
                key_prefix = %prefix(key),
                "Rate limit for unknown cell, ignoring"
            );
            return;
        };

        cell.touch(now);

        if cell.today_tokens >= DAILY_HARD_CAP_TOKENS {
            cell.exceeded = true;
            tracing::info!(
                model = model_name,
                key_prefix = %prefix(key),
                today_tokens = cell.today_tokens,
                "Rate limited over the daily cap, marked exceeded"
            );
            return;
        }

        if cell.just_hit_429 {
            cell.probably_exceeded = true;
            cell.just_hit_429 = false;
            tracing::info!(
                model = model_name,
                key_prefix = %prefix(key),
                "Consecutive rate limit after delay, marked probably exceeded"
            );
        } else {
            cell.just_hit_429 = true;
            tracing::info!(
                model = model_name,
                key_prefix = %prefix(key),
                "Rate limit hit, throttle delay armed for the next attempt"
            );
        }
    }

    /// Re-enable a soft-disabled (model, key) pair. Idempotent.
    pub fn enable_key(&self, model_name: &str, key: &str) {
        let mut state = self.state.lock().unwrap();
        let cell_key = CellKey {
            model: model_name.to_string(),
            key: key.to_string(),
        };
        let Some(cell) = state.cells.get_mut(&cell_key) else {
            tracing::warn!(
                model = model_name,
                key_prefix = %prefix(key),
                "EnableKey for unknown cell, ignoring"
            );
            return;
        };

        if cell.probably_exceeded || cell.just_hit_429 {
            cell.probably_exceeded = false;
            cell.just_hit_429 = false;
            tracing::info!(
                model = model_name,
                key_prefix = %prefix(key),
                "Key re-enabled"
            );
        }
    }

    /// Fire the daily reset when due. Returns the new next-reset datetime
    /// (formatted in the configured zone) when a reset happened, so the
    /// caller can persist it to configuration.
    pub fn check_reset(&self, now: DateTime<Utc>) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if now < state.next_reset {
            return None;
        }

        for cell in state.cells.values_mut() {
            cell.reset_daily();
        }

        let next = reset::next_reset_instant(self.reset_after, self.tz, now);
        state.next_reset = next.with_timezone(&Utc);
        tracing::info!("All daily quotas have been reset");
        Some(next.format(RESET_DATETIME_FORMAT).to_string())
    }

    /// One aggregator tick: sum every cell's 60-second window per model and
    /// per key and append the points to the minute series.
    ///
    /// Takes the engine mutex, then the series mutex (the documented order).
    pub fn record_history_tick(&self) {
        let now = Self::now_ts();
        let mut state = self.state.lock().unwrap();

        let mut model_sums: HashMap<String, u64> = HashMap::new();
        let mut key_sums: HashMap<String, u64> = HashMap::new();

        for (cell_key, cell) in state.cells.iter_mut() {
            cell.touch(now);
            let last_minute = cell.tokens_last_minute();
            *model_sums.entry(cell_key.model.clone()).or_default() += last_minute;
            *key_sums.entry(cell_key.key.clone()).or_default() += last_minute;
        }

        self.series.record_tick(now, &model_sums, &key_sums);
    }

    /// Deep-copy the ledger map. The domain is always exactly the
    /// configured (model, key) pairs.
    pub fn snapshot_cells(&self) -> HashMap<CellKey, UsageCell> {
        self.state.lock().unwrap().cells.clone()
    }

    /// Flush the ledger to the usage snapshot file. Honors a floor between
    /// writes unless `force` is set. Failures are logged, never fatal.
    pub fn save_usage(&self, force: bool) {
        let mut state = self.state.lock().unwrap();

        if !force {
            if let Some(last) = state.last_saved {
                if last.elapsed() < persist::SAVE_FLOOR {
                    return;
                }
            }
        }

        match persist::save_usage(&self.usage_path, state.cells.iter().map(|(k, c)| (k, c))) {
            Ok(()) => {
                state.last_saved = Some(Instant::now());
                tracing::debug!("Usage data saved");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to save usage data");
            }
        }
    }
}

/// First four characters of a key, for log lines. Never the full key.
pub(crate) fn prefix(key: &str) -> String {
    key.chars().take(4).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig::default();
        config.priority_keys = vec!["K1".into(), "K2".into()];
        config.secondary_keys = vec!["K3".into()];
        config.models.clear();
        config.models.insert(
            "m".into(),
            ModelConfig {
                tpm_limit: 1000,
                tpd_limit: None,
            },
        );
        config.default_model = "m".into();
        config.usage_file = dir.path().join("key_usage.json");
        let engine = Engine::from_config(&config).unwrap();
        (engine, dir)
    }

    #[test]
    fn test_select_prefers_first_priority_key() {
        let (engine, _dir) = test_engine();
        let selection = engine.select_key("m").unwrap();
        assert_eq!(selection.key, "K1");
        assert_eq!(selection.model, "m");
        assert_eq!(selection.delay, Duration::ZERO);
    }

    #[test]
    fn test_select_unknown_model_falls_back_to_default() {
        let (engine, _dir) = test_engine();
        let selection = engine.select_key("no-such-model").unwrap();
        assert_eq!(selection.model, "m");
    }

    #[test]
    fn test_select_skips_exceeded_key() {
        let (engine, _dir) = test_engine();
        {
            let mut state = engine.state.lock().unwrap();
            state
                .cells
                .get_mut(&CellKey {
                    model: "m".into(),
                    key: "K1".into(),
                })
                .unwrap()
                .exceeded = true;
        }
        let selection = engine.select_key("m").unwrap();
        assert_eq!(selection.key, "K2");
    }

    #[test]
    fn test_select_is_deterministic() {
        let (engine, _dir) = test_engine();
        let first = engine.select_key("m").unwrap();
        let second = engine.select_key("m").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_select_no_keys_available() {
        let (engine, _dir) = test_engine();
        {
            let mut state = engine.state.lock().unwrap();
            for cell in state.cells.values_mut() {
                cell.exceeded = true;
            }
        }
        let err = engine.select_key("m").unwrap_err();
        assert!(matches!(err, EngineError::NoKeyAvailable { .. }));
    }

    #[test]
    fn test_two_strike_escalation() {
        let (engine, _dir) = test_engine();

        engine.handle_rate_limit("m", "K1");
        {
            let state = engine.state.lock().unwrap();
            let cell = &state.cells[&CellKey {
                model: "m".into(),
                key: "K1".into(),
            }];
            assert!(cell.just_hit_429);
            assert!(!cell.probably_exceeded);
        }

        // Still selectable after the first strike
        assert_eq!(engine.select_key("m").unwrap().key, "K1");

        engine.handle_rate_limit("m", "K1");
        {
            let state = engine.state.lock().unwrap();
            let cell = &state.cells[&CellKey {
                model: "m".into(),
                key: "K1".into(),
            }];
            assert!(!cell.just_hit_429);
            assert!(cell.probably_exceeded);
        }

        // Degraded key loses to the next available one
        assert_eq!(engine.select_key("m").unwrap().key, "K2");
    }

    #[test]
    fn test_success_clears_first_strike() {
        let (engine, _dir) = test_engine();
        engine.handle_rate_limit("m", "K1");
        engine.record_usage("m", "K1", 10);
        engine.handle_rate_limit("m", "K1");

        let state = engine.state.lock().unwrap();
        let cell = &state.cells[&CellKey {
            model: "m".into(),
            key: "K1".into(),
        }];
        // The success in between restarts the sequence: still first strike
        assert!(cell.just_hit_429);
        assert!(!cell.probably_exceeded);
    }

    #[test]
    fn test_enable_key_idempotent() {
        let (engine, _dir) = test_engine();
        engine.handle_rate_limit("m", "K1");
        engine.handle_rate_limit("m", "K1");

        engine.enable_key("m", "K1");
        engine.enable_key("m", "K1");

        let state = engine.state.lock().unwrap();
        let cell = &state.cells[&CellKey {
            model: "m".into(),
            key: "K1".into(),
        }];
        assert!(!cell.probably_exceeded);
        assert!(!cell.just_hit_429);
    }

    #[test]
    fn test_rate_limit_over_daily_cap_marks_exceeded() {
        let (engine, _dir) = test_engine();
        {
            let mut state = engine.state.lock().unwrap();
            state
                .cells
                .get_mut(&CellKey {
                    model: "m".into(),
                    key: "K1".into(),
                })
                .unwrap()
                .today_tokens = DAILY_HARD_CAP_TOKENS + 1;
        }
        engine.handle_rate_limit("m", "K1");

        let state = engine.state.lock().unwrap();
        let cell = &state.cells[&CellKey {
            model: "m".into(),
            key: "K1".into(),
        }];
        assert!(cell.exceeded);
        assert!(!cell.just_hit_429);
    }

    #[test]
    fn test_check_reset_advances_schedule() {
        let (engine, _dir) = test_engine();
        engine.record_usage("m", "K1", 5000);
        {
            let mut state = engine.state.lock().unwrap();
            let cell = state
                .cells
                .get_mut(&CellKey {
                    model: "m".into(),
                    key: "K1".into(),
                })
                .unwrap();
            cell.exceeded = true;
            state.next_reset = Utc::now() - chrono::Duration::minutes(1);
        }

        let now = Utc::now();
        let next = engine.check_reset(now).expect("reset should fire");
        assert!(!next.is_empty());

        let state = engine.state.lock().unwrap();
        let cell = &state.cells[&CellKey {
            model: "m".into(),
            key: "K1".into(),
        }];
        assert_eq!(cell.total_tokens, 5000);
        assert_eq!(cell.today_tokens, 0);
        assert!(cell.history_24h.is_empty());
        assert!(!cell.exceeded);
        assert!(state.next_reset > now);
    }

    #[test]
    fn test_check_reset_not_due() {
        let (engine, _dir) = test_engine();
        {
            let mut state = engine.state.lock().unwrap();
            state.next_reset = Utc::now() + chrono::Duration::hours(1);
        }
        assert!(engine.check_reset(Utc::now()).is_none());
    }

    #[test]
    fn test_peek_key_does_not_mutate() {
        let (engine, _dir) = test_engine();
        engine.record_usage("m", "K1", 10);

        let before = {
            let state = engine.state.lock().unwrap();
            state.cells[&CellKey {
                model: "m".into(),
                key: "K1".into(),
            }]
            .clone()
        };

        assert_eq!(engine.peek_key("m").as_deref(), Some("K1"));

        let after = {
            let state = engine.state.lock().unwrap();
            state.cells[&CellKey {
                model: "m".into(),
                key: "K1".into(),
            }]
            .clone()
        };
        assert_eq!(before.total_tokens, after.total_tokens);
        assert_eq!(before.history_24h, after.history_24h);
    }

    #[test]
    fn test_history_tick_records_series() {
        let (engine, _dir) = test_engine();
        engine.record_usage("m", "K1", 25);
        engine.record_history_tick();

        let models = engine.series.model_series();
        assert_eq!(models["m"].last().unwrap().cost_token, 25);

        let keys = engine.series.key_series();
        assert_eq!(keys["K1"].last().unwrap().cost_token, 25);
        assert_eq!(keys["K2"].last().unwrap().cost_token, 0);
    }
}
