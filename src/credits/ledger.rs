//! Per-user ledger records and the credit recovery computation.
//!
//! Recovery is a pure function over an already-fetched record: the daily
//! reset runs first and overwrites the balance outright, then hourly accrual
//! grants one credit per whole elapsed hour under two caps (absolute balance
//! ceiling and a per-day recovery budget). Callers persist the result.

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Credits granted at account creation and restored by every daily reset.
pub const DAILY_BASELINE: i64 = 4;

/// Hard ceiling on the balance; hourly recovery never pushes past this.
pub const MAX_BALANCE: i64 = 8;

/// Maximum credits hourly recovery may grant between two daily resets.
pub const DAILY_RECOVERY_CAP: i64 = 4;

/// One user's credit balance and recovery bookkeeping.
///
/// Timestamps are UTC in memory and RFC 3339 text at rest and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Opaque user identifier (unique key).
    pub user_id: String,
    /// Spendable balance.
    pub current_credits: i64,
    /// When hourly recovery last granted a non-zero amount.
    pub last_credit_award_time: DateTime<Utc>,
    /// When the daily reset last ran.
    pub daily_credit_reset_time: DateTime<Utc>,
    /// Credits granted by hourly recovery since the last daily reset.
    pub daily_recovered_credits: i64,
}

impl LedgerRecord {
    /// A fresh record: baseline balance, both timestamps at `now`.
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_credits: DAILY_BASELINE,
            last_credit_award_time: now,
            daily_credit_reset_time: now,
            daily_recovered_credits: 0,
        }
    }
}

/// Start of the calendar day containing `now`, in `now`'s own timezone.
fn day_start<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
    match midnight.and_local_timezone(now.timezone()) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
        // A DST gap swallowed midnight; the day effectively starts at `now`.
        LocalResult::None => now.clone(),
    }
}

/// Apply daily reset and hourly recovery to `record` as of `now`.
///
/// The timezone of `now` governs where the midnight boundary falls. Returns
/// the updated record; nothing is persisted here.
pub fn recover<Tz: TimeZone>(record: &LedgerRecord, now: &DateTime<Tz>) -> LedgerRecord {
    let now_utc = now.with_timezone(&Utc);
    let midnight = day_start(now).with_timezone(&Utc);

    let mut updated = record.clone();

    // Daily reset: overwrites balance and the recovery counter outright.
    // The award timestamp is left alone, so accrual below may still fire
    // in the same pass against the freshly cleared counter.
    if updated.daily_credit_reset_time < midnight {
        updated.current_credits = DAILY_BASELINE;
        updated.daily_credit_reset_time = now_utc;
        updated.daily_recovered_credits = 0;
    }

    // Hourly accrual: one credit per whole elapsed hour, double-capped.
    if updated.current_credits < MAX_BALANCE && updated.daily_recovered_credits < DAILY_RECOVERY_CAP
    {
        let elapsed_hours = (now_utc - updated.last_credit_award_time).num_hours();
        if elapsed_hours >= 1 {
            let grant = elapsed_hours
                .min(MAX_BALANCE - updated.current_credits)
                .min(DAILY_RECOVERY_CAP - updated.daily_recovered_credits);
            if grant > 0 {
                updated.current_credits += grant;
                updated.daily_recovered_credits += grant;
                // A zero grant must not advance the award time: fractional
                // progress toward the next whole hour is preserved.
                updated.last_credit_award_time = now_utc;
            }
        }
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 27, 12, 0, 0).unwrap()
    }

    fn record_at(now: DateTime<Utc>) -> LedgerRecord {
        LedgerRecord::new("user_a", now)
    }

    #[test]
    fn new_record_has_baseline_defaults() {
        let r = record_at(noon());
        assert_eq!(r.current_credits, DAILY_BASELINE);
        assert_eq!(r.daily_recovered_credits, 0);
        assert_eq!(r.last_credit_award_time, noon());
        assert_eq!(r.daily_credit_reset_time, noon());
    }

    #[test]
    fn recovery_is_idempotent_within_the_hour() {
        let now = noon();
        let mut r = record_at(now - Duration::hours(3));
        r.current_credits = 2;

        let first = recover(&r, &now);
        let second = recover(&first, &(now + Duration::minutes(30)));
        assert_eq!(first, second);
    }

    #[test]
    fn daily_reset_dominates_prior_values() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 7;
        r.daily_recovered_credits = 4;
        r.daily_credit_reset_time = now - Duration::hours(25);

        let out = recover(&r, &now);
        assert_eq!(out.current_credits, DAILY_BASELINE);
        assert_eq!(out.daily_recovered_credits, 0);
        assert_eq!(out.daily_credit_reset_time, now);
    }

    #[test]
    fn daily_reset_then_hourly_accrual_in_one_pass() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 1;
        r.daily_recovered_credits = 4;
        r.daily_credit_reset_time = now - Duration::hours(25);
        r.last_credit_award_time = now - Duration::hours(3);

        // Reset restores 4 and clears the counter, then 3 elapsed hours grant 3.
        let out = recover(&r, &now);
        assert_eq!(out.current_credits, 7);
        assert_eq!(out.daily_recovered_credits, 3);
        assert_eq!(out.last_credit_award_time, now);
    }

    #[test]
    fn hourly_grant_formula() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 3;
        r.daily_recovered_credits = 1;
        r.last_credit_award_time = now - Duration::hours(5);

        // min(5 elapsed, 8-3=5 headroom, 4-1=3 daily budget) = 3
        let out = recover(&r, &now);
        assert_eq!(out.current_credits, 6);
        assert_eq!(out.daily_recovered_credits, 4);
        assert_eq!(out.last_credit_award_time, now);
    }

    #[test]
    fn no_grant_at_max_balance() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = MAX_BALANCE;
        r.last_credit_award_time = now - Duration::hours(6);

        let out = recover(&r, &now);
        assert_eq!(out, r);
    }

    #[test]
    fn no_grant_when_daily_budget_exhausted() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 5;
        r.daily_recovered_credits = DAILY_RECOVERY_CAP;
        r.last_credit_award_time = now - Duration::hours(6);

        let out = recover(&r, &now);
        assert_eq!(out, r);
    }

    #[test]
    fn partial_hour_leaves_award_time_untouched() {
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 2;
        r.last_credit_award_time = now - Duration::minutes(59);

        let out = recover(&r, &now);
        assert_eq!(out.current_credits, 2);
        assert_eq!(out.last_credit_award_time, now - Duration::minutes(59));
    }

    #[test]
    fn future_award_time_grants_nothing() {
        // Clock skew: a record written by a fast clock must not panic or grant.
        let now = noon();
        let mut r = record_at(now);
        r.current_credits = 2;
        r.last_credit_award_time = now + Duration::hours(2);

        let out = recover(&r, &now);
        assert_eq!(out.current_credits, 2);
    }

    #[test]
    fn caps_hold_over_long_recover_sequences() {
        let start = noon();
        let mut r = record_at(start);
        r.current_credits = 0;

        // Recover every 90 minutes for a week; only recover() mutates.
        for step in 1..=112 {
            let now = start + Duration::minutes(90 * step);
            r = recover(&r, &now);
            assert!((0..=MAX_BALANCE).contains(&r.current_credits), "balance out of range: {r:?}");
            assert!(
                (0..=DAILY_RECOVERY_CAP).contains(&r.daily_recovered_credits),
                "daily counter out of range: {r:?}"
            );
        }
    }

    #[test]
    fn midnight_boundary_follows_local_timezone() {
        // 01:00 on Aug 27 in UTC+9; local midnight is Aug 26 15:00 UTC.
        let kst = FixedOffset::east_opt(9 * 3600).unwrap();
        let now = kst.with_ymd_and_hms(2026, 8, 27, 1, 0, 0).unwrap();

        let mut r = record_at(now.with_timezone(&Utc));
        r.current_credits = 1;
        // 23:00 local the previous day: before local midnight, resets.
        r.daily_credit_reset_time = Utc.with_ymd_and_hms(2026, 8, 26, 14, 0, 0).unwrap();
        let out = recover(&r, &now);
        assert_eq!(out.current_credits, DAILY_BASELINE);

        // 00:30 local the same day: after local midnight, no reset.
        r.daily_credit_reset_time = Utc.with_ymd_and_hms(2026, 8, 26, 15, 30, 0).unwrap();
        let out = recover(&r, &now);
        assert_eq!(out.current_credits, 1);
    }

    #[test]
    fn reset_exactly_at_midnight_is_not_stale() {
        let midnight = Utc.with_ymd_and_hms(2026, 8, 27, 0, 0, 0).unwrap();
        let mut r = record_at(midnight);
        r.current_credits = 1;
        r.daily_credit_reset_time = midnight;

        let out = recover(&r, &(midnight + Duration::minutes(5)));
        assert_eq!(out.current_credits, 1);
    }

    #[test]
    fn record_serializes_with_rfc3339_timestamps() {
        let r = record_at(noon());
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"user_id\":\"user_a\""));
        assert!(json.contains("2026-08-27T12:00:00Z"));

        let parsed: LedgerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, r);
    }
}
