//! Per-(model, key) token accounting cells.
//!
//! Each cell keeps a lifetime total, a daily counter, and an append-only
//! log of usage records covering the last 24 hours. Window trimming is
//! lazy: every read path calls [`UsageCell::touch`] first, which drops
//! expired records and materializes the 60-second window.

use serde::{Deserialize, Serialize};

/// Seconds in the widest sliding window (24 h).
pub const DAY_WINDOW_SECS: i64 = 86_400;

/// Seconds in the TPM window.
pub const MINUTE_WINDOW_SECS: i64 = 60;

/// One recorded slice of token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Tokens consumed by the request
    pub cost_token: u64,
}

/// Accounting state for a single (model, key) pair.
///
/// The model configuration is referenced by name; budget limits live in the
/// configuration map and are never copied into the cell.
#[derive(Debug, Clone, Default)]
pub struct UsageCell {
    /// Lifetime token total; never decremented, survives daily resets
    pub total_tokens: u64,
    /// Tokens recorded since the last daily reset
    pub today_tokens: u64,
    /// Usage records from the last 24 hours, insertion-ordered
    pub history_24h: Vec<UsageRecord>,
    /// Subset of `history_24h` within the last 60 seconds; rebuilt by `touch`
    pub window_60s: Vec<UsageRecord>,
    /// Soft-disabled: a 429 arrived even after a delay was imposed
    pub probably_exceeded: bool,
    /// Hard-disabled for the day (TPD or daily cap hit)
    pub exceeded: bool,
    /// One 429 observed; the next selection imposes a delay. Never persisted.
    pub just_hit_429: bool,
}

impl UsageCell {
    /// Drop records older than 24 hours and rebuild the 60-second window.
    ///
    /// Idempotent and cheap; every read path calls this first so garbage
    /// collection stays lazy.
    pub fn touch(&mut self, now: i64) {
        self.history_24h
            .retain(|r| r.timestamp >= now - DAY_WINDOW_SECS);
        self.window_60s = self
            .history_24h
            .iter()
            .filter(|r| r.timestamp >= now - MINUTE_WINDOW_SECS)
            .copied()
            .collect();
    }

    /// Record a successful request's token count.
    ///
    /// A success also clears the one-strike 429 flag: the delay mechanism
    /// worked, no escalation is pending.
    pub fn append(&mut self, now: i64, tokens: u64) {
        self.total_tokens += tokens;
        self.today_tokens += tokens;
        self.history_24h.push(UsageRecord {
            timestamp: now,
            cost_token: tokens,
        });
        self.just_hit_429 = false;
        self.touch(now);
    }

    /// Sum of tokens within the last 60 seconds (after a `touch`).
    pub fn tokens_last_minute(&self) -> u64 {
        self.window_60s.iter().map(|r| r.cost_token).sum()
    }

    /// Sum of tokens within the last 24 hours (after a `touch`).
    pub fn tokens_last_day(&self) -> u64 {
        self.history_24h.iter().map(|r| r.cost_token).sum()
    }

    /// Daily reset: clears the daily counter, the history, and both
    /// disable flags. The lifetime total is preserved.
    pub fn reset_daily(&mut self) {
        self.today_tokens = 0;
        self.history_24h.clear();
        self.window_60s.clear();
        self.exceeded = false;
        self.probably_exceeded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_accumulates_totals() {
        let mut cell = UsageCell::default();
        cell.append(1000, 10);
        cell.append(1001, 20);
        cell.append(1002, 30);

        assert_eq!(cell.total_tokens, 60);
        assert_eq!(cell.today_tokens, 60);
        assert_eq!(cell.history_24h.len(), 3);
    }

    #[test]
    fn test_touch_drops_expired_records() {
        let mut cell = UsageCell::default();
        cell.append(0, 5);
        cell.append(100, 5);

        cell.touch(100 + DAY_WINDOW_SECS);
        assert_eq!(cell.history_24h.len(), 1);
        assert_eq!(cell.history_24h[0].timestamp, 100);

        cell.touch(101 + DAY_WINDOW_SECS);
        assert!(cell.history_24h.is_empty());
        // Totals unaffected by trimming
        assert_eq!(cell.total_tokens, 10);
    }

    #[test]
    fn test_window_60s_subset_of_history() {
        let mut cell = UsageCell::default();
        cell.append(0, 100);
        cell.append(50, 200);
        cell.append(90, 300);

        cell.touch(100);
        assert_eq!(cell.tokens_last_minute(), 500); // records at 50 and 90
        assert_eq!(cell.tokens_last_day(), 600);
        for r in &cell.window_60s {
            assert!(cell.history_24h.contains(r));
        }
    }

    #[test]
    fn test_append_clears_429_flag() {
        let mut cell = UsageCell {
            just_hit_429: true,
            ..Default::default()
        };
        cell.append(10, 1);
        assert!(!cell.just_hit_429);
    }

    #[test]
    fn test_reset_preserves_lifetime_total() {
        let mut cell = UsageCell::default();
        cell.append(10, 5000);
        cell.exceeded = true;
        cell.probably_exceeded = true;

        cell.reset_daily();

        assert_eq!(cell.total_tokens, 5000);
        assert_eq!(cell.today_tokens, 0);
        assert!(cell.history_24h.is_empty());
        assert!(!cell.exceeded);
        assert!(!cell.probably_exceeded);
    }

    #[test]
    fn test_boundary_record_exactly_24h_old_kept() {
        let mut cell = UsageCell::default();
        cell.append(1000, 7);
        cell.touch(1000 + DAY_WINDOW_SECS);
        assert_eq!(cell.history_24h.len(), 1);
    }
}
