//! Last-hour usage time series for the dashboard.
//!
//! A 5-second aggregator task sums each cell's 60-second window per model
//! and per key and records one data point per tick. The snapshot reporter
//! rebuckets these points into minute-aligned chart labels.
//!
//! Lock order: the aggregator takes the engine mutex first (to read the
//! ledger), then the series mutex held here. The snapshot reporter does the
//! same. Never acquire them in the other order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::ledger::UsageRecord;
use crate::engine::Engine;

/// Retention window for chart points.
pub const HOUR_WINDOW_SECS: i64 = 3_600;

/// Aggregator cadence.
pub const HISTORY_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct SeriesState {
    per_model: HashMap<String, Vec<UsageRecord>>,
    per_key: HashMap<String, Vec<UsageRecord>>,
}

/// Thread-safe store of last-hour usage points per model and per key.
#[derive(Debug, Default)]
pub struct SeriesStore {
    inner: Mutex<SeriesState>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one aggregated data point per series and prune points older
    /// than the retention window.
    pub fn record_tick(
        &self,
        now: i64,
        model_sums: &HashMap<String, u64>,
        key_sums: &HashMap<String, u64>,
    ) {
        let mut state = self.inner.lock().unwrap();

        for (model, tokens) in model_sums {
            let series = state.per_model.entry(model.clone()).or_default();
            series.push(UsageRecord {
                timestamp: now,
                cost_token: *tokens,
            });
            series.retain(|p| p.timestamp >= now - HOUR_WINDOW_SECS);
        }

        for (key, tokens) in key_sums {
            let series = state.per_key.entry(key.clone()).or_default();
            series.push(UsageRecord {
                timestamp: now,
                cost_token: *tokens,
            });
            series.retain(|p| p.timestamp >= now - HOUR_WINDOW_SECS);
        }
    }

    /// Clone the per-model series map.
    pub fn model_series(&self) -> HashMap<String, Vec<UsageRecord>> {
        self.inner.lock().unwrap().per_model.clone()
    }

    /// Clone the per-key series map.
    pub fn key_series(&self) -> HashMap<String, Vec<UsageRecord>> {
        self.inner.lock().unwrap().per_key.clone()
    }
}

/// Background task that feeds the series store from the ledger.
pub struct HistoryAggregator {
    engine: Arc<Engine>,
}

impl HistoryAggregator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Start the aggregator loop.
    /// Returns a JoinHandle that resolves when the task stops.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HISTORY_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                tick_seconds = HISTORY_TICK.as_secs(),
                "Usage history aggregator started"
            );

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Usage history aggregator shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.engine.record_history_tick();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_record_tick_appends_points() {
        let store = SeriesStore::new();
        store.record_tick(100, &sums(&[("m1", 50)]), &sums(&[("k1", 50)]));
        store.record_tick(105, &sums(&[("m1", 70)]), &sums(&[("k1", 70)]));

        let models = store.model_series();
        assert_eq!(models["m1"].len(), 2);
        assert_eq!(models["m1"][1].cost_token, 70);

        let keys = store.key_series();
        assert_eq!(keys["k1"].len(), 2);
    }

    #[test]
    fn test_record_tick_prunes_old_points() {
        let store = SeriesStore::new();
        store.record_tick(0, &sums(&[("m1", 10)]), &HashMap::new());
        store.record_tick(HOUR_WINDOW_SECS + 1, &sums(&[("m1", 20)]), &HashMap::new());

        let models = store.model_series();
        assert_eq!(models["m1"].len(), 1);
        assert_eq!(models["m1"][0].cost_token, 20);
    }

    #[test]
    fn test_independent_series_per_name() {
        let store = SeriesStore::new();
        store.record_tick(10, &sums(&[("m1", 1), ("m2", 2)]), &HashMap::new());

        let models = store.model_series();
        assert_eq!(models.len(), 2);
        assert_eq!(models["m2"][0].cost_token, 2);
    }
}
