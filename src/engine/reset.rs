//! Daily quota reset scheduling.
//!
//! A once-per-minute tick checks whether the scheduled reset instant has
//! passed. On fire, every cell's daily counters and disable flags are
//! cleared (lifetime totals are preserved) and the next reset instant is
//! computed from the configured local time of day, then written back to the
//! configuration file. Persistence failures are logged and never stop the
//! scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::engine::Engine;

/// Scheduler cadence.
pub const RESET_TICK: Duration = Duration::from_secs(60);

/// Compute the next reset instant: the configured time of day in the given
/// zone, on today's local date, rolled forward one day when already passed.
///
/// Local times that fall into a DST gap roll forward to the next day that
/// has them.
pub fn next_reset_instant(after: NaiveTime, tz: Tz, now: DateTime<Utc>) -> DateTime<Tz> {
    let local_now = now.with_timezone(&tz);
    let mut date = local_now.date_naive();
    loop {
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(after)).earliest() {
            if candidate > local_now {
                return candidate;
            }
        }
        date = date + chrono::Days::new(1);
    }
}

/// Background task that fires daily quota resets.
pub struct ResetScheduler {
    engine: Arc<Engine>,
    config_path: PathBuf,
}

impl ResetScheduler {
    pub fn new(engine: Arc<Engine>, config_path: PathBuf) -> Self {
        Self {
            engine,
            config_path,
        }
    }

    /// Start the scheduler loop.
    /// Returns a JoinHandle that resolves when the task stops.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESET_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!("Quota reset scheduler started");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Quota reset scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Some(next) = self.engine.check_reset(Utc::now()) {
                            tracing::info!(next_reset = %next, "Quotas reset");
                            self.persist_next_reset(&next);
                        }
                    }
                }
            }
        })
    }

    /// Rewrite `next_quota_reset_datetime` in the configuration file.
    fn persist_next_reset(&self, next: &str) {
        let mut config = match ProxyConfig::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config after quota reset");
                return;
            }
        };
        config.next_quota_reset_datetime = next.to_string();
        if let Err(e) = config.save(&self.config_path) {
            tracing::error!(error = %e, "Failed to save config after quota reset");
        }
    }
}
