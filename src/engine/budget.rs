//! Budget policy: availability classification and pre-call delay.
//!
//! Applied to a freshly touched cell under the engine mutex. Classification
//! may flip a cell to `exceeded` (hard daily cap or TPD cap); the delay is
//! a pure function of the 60-second window.

use std::time::Duration;

use crate::config::ModelConfig;
use crate::engine::ledger::UsageCell;

/// Daily token ceiling applied to every key regardless of model limits.
pub const DAILY_HARD_CAP_TOKENS: u64 = 4_100_000;

/// Availability tier of a (model, key) pair for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Fully available; preferred candidates
    Available,
    /// Soft-disabled (`probably_exceeded`); used only when nothing else is
    Degraded,
    /// Hard-disabled until the daily reset
    Unavailable,
}

/// Classify a touched cell against its model budget.
///
/// Sets `exceeded` when the hard daily cap or the model's TPD cap is hit,
/// so the flag sticks for the rest of the day.
pub fn classify(cell: &mut UsageCell, model: &ModelConfig) -> Availability {
    if cell.today_tokens >= DAILY_HARD_CAP_TOKENS {
        cell.exceeded = true;
        return Availability::Unavailable;
    }

    if let Some(tpd) = model.tpd_limit {
        if cell.tokens_last_day() >= tpd {
            cell.exceeded = true;
            return Availability::Unavailable;
        }
    }

    if cell.exceeded {
        Availability::Unavailable
    } else if cell.probably_exceeded {
        Availability::Degraded
    } else {
        Availability::Available
    }
}

/// Pre-call delay derived from the 60-second window.
///
/// Zero up to half the TPM budget, then ramps linearly, capped at a full
/// minute once the budget is spent.
pub fn pre_call_delay(cell: &UsageCell, model: &ModelConfig) -> Duration {
    let t60 = cell.tokens_last_minute();
    let tpm = model.tpm_limit;

    if t60 > tpm {
        return Duration::from_secs(60);
    }
    if t60 <= tpm / 2 {
        return Duration::ZERO;
    }

    let excess = t60 - tpm / 2;
    let seconds = excess as f64 / tpm as f64 * 60.0;
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(tpm: u64, tpd: Option<u64>) -> ModelConfig {
        ModelConfig {
            tpm_limit: tpm,
            tpd_limit: tpd,
        }
    }

    fn cell_with_minute_usage(tokens: u64) -> UsageCell {
        let mut cell = UsageCell::default();
        cell.append(1000, tokens);
        cell.touch(1000);
        cell
    }

    #[test]
    fn test_delay_zero_at_half_limit() {
        let cell = cell_with_minute_usage(500);
        assert_eq!(pre_call_delay(&cell, &model(1000, None)), Duration::ZERO);
    }

    #[test]
    fn test_delay_linear_between_half_and_full() {
        // ((600 - 500) / 1000) * 60 = 6 s
        let cell = cell_with_minute_usage(600);
        assert_eq!(
            pre_call_delay(&cell, &model(1000, None)),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_delay_at_exact_limit_within_bound() {
        let cell = cell_with_minute_usage(1000);
        let delay = pre_call_delay(&cell, &model(1000, None));
        assert!(delay <= Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_delay_full_minute_over_limit() {
        let cell = cell_with_minute_usage(1001);
        assert_eq!(
            pre_call_delay(&cell, &model(1000, None)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_classify_available() {
        let mut cell = UsageCell::default();
        assert_eq!(
            classify(&mut cell, &model(1000, None)),
            Availability::Available
        );
    }

    #[test]
    fn test_classify_degraded() {
        let mut cell = UsageCell {
            probably_exceeded: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&mut cell, &model(1000, None)),
            Availability::Degraded
        );
    }

    #[test]
    fn test_classify_exceeded_flag() {
        let mut cell = UsageCell {
            exceeded: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&mut cell, &model(1000, None)),
            Availability::Unavailable
        );
    }

    #[test]
    fn test_classify_hard_daily_cap_sets_exceeded() {
        let mut cell = UsageCell {
            today_tokens: DAILY_HARD_CAP_TOKENS,
            ..Default::default()
        };
        assert_eq!(
            classify(&mut cell, &model(1000, None)),
            Availability::Unavailable
        );
        assert!(cell.exceeded);
    }

    #[test]
    fn test_classify_tpd_cap_sets_exceeded() {
        let mut cell = UsageCell::default();
        cell.append(1000, 600);
        cell.touch(1000);

        assert_eq!(
            classify(&mut cell, &model(1000, Some(500))),
            Availability::Unavailable
        );
        assert!(cell.exceeded);
    }

    #[test]
    fn test_classify_under_tpd_cap_stays_available() {
        let mut cell = UsageCell::default();
        cell.append(1000, 400);
        cell.touch(1000);

        assert_eq!(
            classify(&mut cell, &model(1000, Some(500))),
            Availability::Available
        );
        assert!(!cell.exceeded);
    }

    #[test]
    fn test_record_usage_crossing_cap_defers_exceeded() {
        // Appending past the cap does not set the flag; only the next
        // classification does.
        let mut cell = UsageCell::default();
        cell.append(1000, DAILY_HARD_CAP_TOKENS + 1);
        assert!(!cell.exceeded);

        classify(&mut cell, &model(1000, None));
        assert!(cell.exceeded);
    }
}
