//! Read-only status snapshot for the dashboard.
//!
//! Aggregates the ledger, registry, and budget flags into one serializable
//! view: grand totals, per-key per-model rows, the disjoint key sets, and
//! the last-hour minute-bucketed chart series.

use std::collections::{BTreeSet, HashMap};

use chrono::TimeZone;
use chrono_tz::Tz;
use serde::Serialize;

use crate::engine::history::HOUR_WINDOW_SECS;
use crate::engine::ledger::UsageRecord;
use crate::engine::{CellKey, Engine};

/// Line colors assigned to chart series by registration order.
const SERIES_COLORS: [&str; 10] = [
    "rgba(54, 162, 235, 1)",
    "rgba(255, 99, 132, 1)",
    "rgba(75, 192, 192, 1)",
    "rgba(255, 206, 86, 1)",
    "rgba(153, 102, 255, 1)",
    "rgba(255, 159, 64, 1)",
    "rgba(99, 255, 132, 1)",
    "rgba(235, 54, 162, 1)",
    "rgba(86, 255, 206, 1)",
    "rgba(102, 153, 255, 1)",
];

/// Fill colors matching `SERIES_COLORS`.
const SERIES_FILL_COLORS: [&str; 10] = [
    "rgba(54, 162, 235, 0.2)",
    "rgba(255, 99, 132, 0.2)",
    "rgba(75, 192, 192, 0.2)",
    "rgba(255, 206, 86, 0.2)",
    "rgba(153, 102, 255, 0.2)",
    "rgba(255, 159, 64, 0.2)",
    "rgba(99, 255, 132, 0.2)",
    "rgba(235, 54, 162, 0.2)",
    "rgba(86, 255, 206, 0.2)",
    "rgba(102, 153, 255, 0.2)",
];

/// Usage row for one (key, model) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsageStatus {
    pub tokens_last_minute: u64,
    pub total_tokens: u64,
    pub today_usage: u64,
    pub is_temporarily_disabled: bool,
    pub daily_quota_exceeded: bool,
}

/// Per-key map of model usage rows.
pub type KeyStatus = HashMap<String, ModelUsageStatus>;

/// Budget figures exposed per model for the dashboard tables.
#[derive(Debug, Clone, Serialize)]
pub struct ModelBudgetView {
    pub tpm_limit: u64,
}

/// One chart-ready dataset.
#[derive(Debug, Clone, Serialize)]
pub struct ChartDataset {
    pub label: String,
    pub data: Vec<u64>,
    pub fill: bool,
    #[serde(rename = "borderColor")]
    pub border_color: String,
    #[serde(rename = "backgroundColor")]
    pub background_color: String,
    pub tension: f64,
}

/// Labels plus datasets for one chart.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
}

/// Complete dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub grand_total_tokens: u64,
    pub grand_total_today_usage: u64,
    pub current_masked_key: String,
    pub key_usage_status: HashMap<String, KeyStatus>,
    pub priority_keys: Vec<String>,
    pub secondary_keys: Vec<String>,
    pub unavailable_keys: Vec<String>,
    pub rate_limited_keys: Vec<String>,
    pub quota_exhausted_keys: Vec<String>,
    pub model_order: Vec<String>,
    pub models_config: HashMap<String, ModelBudgetView>,
    pub model_chart_data: ChartData,
    pub key_chart_data: ChartData,
    pub active_key_model_chart_data: ChartData,
}

/// Mask a key for display: first and last four characters.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Build minute-aligned, zero-filled chart data over the last hour.
///
/// Points are rebucketed to their minute; when two sub-minute points land in
/// the same bucket the later one wins, which only holds because the
/// aggregator cadence is a fixed 5 seconds. Switch to summation if that
/// cadence ever becomes configurable.
pub fn build_chart_data(
    source: &HashMap<String, Vec<UsageRecord>>,
    now: i64,
    series_order: &[String],
    tz: Tz,
) -> ChartData {
    let mut minutes: Vec<i64> = (0..60)
        .rev()
        .map(|i| (now - i * 60) / 60 * 60)
        .collect();
    minutes.dedup();

    let labels: Vec<String> = minutes
        .iter()
        .map(|ts| match tz.timestamp_opt(*ts, 0) {
            chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
            _ => String::new(),
        })
        .collect();

    let mut chart = ChartData {
        labels,
        datasets: Vec::new(),
    };

    let mut color_index = 0;
    for series_name in series_order {
        let Some(points) = source.get(series_name) else {
            continue;
        };
        if !points
            .iter()
            .any(|p| p.timestamp >= now - HOUR_WINDOW_SECS)
        {
            continue;
        }

        let mut buckets: HashMap<i64, u64> = HashMap::new();
        for point in points {
            buckets.insert(point.timestamp / 60 * 60, point.cost_token);
        }

        let data: Vec<u64> = minutes
            .iter()
            .map(|m| buckets.get(m).copied().unwrap_or(0))
            .collect();

        chart.datasets.push(ChartDataset {
            label: series_name.clone(),
            data,
            fill: true,
            border_color: SERIES_COLORS[color_index % SERIES_COLORS.len()].to_string(),
            background_color: SERIES_FILL_COLORS[color_index % SERIES_FILL_COLORS.len()]
                .to_string(),
            tension: 0.4,
        });
        color_index += 1;
    }

    chart
}

impl Engine {
    /// Produce the full dashboard snapshot.
    ///
    /// Takes the engine mutex, then the series mutex (the documented order).
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock().unwrap();

        let mut model_order: Vec<String> = self.models.keys().cloned().collect();
        model_order.sort();

        let models_config: HashMap<String, ModelBudgetView> = self
            .models
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    ModelBudgetView {
                        tpm_limit: m.tpm_limit,
                    },
                )
            })
            .collect();

        let mut grand_total_tokens = 0u64;
        let mut grand_total_today_usage = 0u64;
        let mut key_usage_status: HashMap<String, KeyStatus> = HashMap::new();
        let mut rate_limited: BTreeSet<String> = BTreeSet::new();
        let mut quota_exhausted: BTreeSet<String> = BTreeSet::new();

        let all_keys: Vec<String> = self.registry.iter().map(|k| k.key.clone()).collect();
        for key in &all_keys {
            let mut key_status = KeyStatus::new();
            for model_name in &model_order {
                let cell_key = CellKey {
                    model: model_name.clone(),
                    key: key.clone(),
                };
                let Some(cell) = state.cells.get_mut(&cell_key) else {
                    continue;
                };
                cell.touch(now);

                grand_total_tokens += cell.total_tokens;
                grand_total_today_usage += cell.today_tokens;

                key_status.insert(
                    model_name.clone(),
                    ModelUsageStatus {
                        tokens_last_minute: cell.tokens_last_minute(),
                        total_tokens: cell.total_tokens,
                        today_usage: cell.today_tokens,
                        is_temporarily_disabled: cell.probably_exceeded,
                        daily_quota_exceeded: cell.exceeded,
                    },
                );

                if cell.probably_exceeded {
                    rate_limited.insert(key.clone());
                }
                if cell.exceeded {
                    quota_exhausted.insert(key.clone());
                }
            }
            key_usage_status.insert(key.clone(), key_status);
        }

        // Preferred key for the default model, via the non-mutating selector.
        let current_raw_key = self.peek_key_in(&state, &self.default_model);
        let current_masked_key = current_raw_key
            .as_deref()
            .map(mask_key)
            .unwrap_or_else(|| "None".to_string());

        // Last-hour usage of the preferred key, rebucketed per model from
        // its 24-hour history.
        let mut active_key_usage: HashMap<String, Vec<UsageRecord>> = HashMap::new();
        if let Some(raw_key) = &current_raw_key {
            for model_name in &model_order {
                let cell_key = CellKey {
                    model: model_name.clone(),
                    key: raw_key.clone(),
                };
                let Some(cell) = state.cells.get(&cell_key) else {
                    continue;
                };
                let mut buckets: HashMap<i64, u64> = HashMap::new();
                for record in &cell.history_24h {
                    if record.timestamp >= now - HOUR_WINDOW_SECS {
                        *buckets.entry(record.timestamp / 60 * 60).or_default() +=
                            record.cost_token;
                    }
                }
                let mut series: Vec<UsageRecord> = buckets
                    .into_iter()
                    .map(|(timestamp, cost_token)| UsageRecord {
                        timestamp,
                        cost_token,
                    })
                    .collect();
                series.sort_by_key(|r| r.timestamp);
                active_key_usage.insert(model_name.clone(), series);
            }
        }

        // Engine mutex is still held; the series store locks second.
        let model_chart_data =
            build_chart_data(&self.series.model_series(), now, &model_order, self.tz);
        let key_chart_data = build_chart_data(&self.series.key_series(), now, &all_keys, self.tz);
        let active_key_model_chart_data =
            build_chart_data(&active_key_usage, now, &model_order, self.tz);

        let (priority_keys, secondary_keys): (Vec<_>, Vec<_>) = {
            let mut priority = Vec::new();
            let mut secondary = Vec::new();
            for key_info in self.registry.iter() {
                match key_info.class {
                    crate::engine::KeyClass::Priority => priority.push(key_info.key.clone()),
                    crate::engine::KeyClass::Secondary => secondary.push(key_info.key.clone()),
                }
            }
            (priority, secondary)
        };

        StatusSnapshot {
            grand_total_tokens,
            grand_total_today_usage,
            current_masked_key,
            key_usage_status,
            priority_keys,
            secondary_keys,
            unavailable_keys: Vec::new(),
            rate_limited_keys: rate_limited.into_iter().collect(),
            quota_exhausted_keys: quota_exhausted.into_iter().collect(),
            model_order,
            models_config,
            model_chart_data,
            key_chart_data,
            active_key_model_chart_data,
        }
    }
}
