//! SQLite-backed credit ledger store.
//!
//! One row per user:
//! - `credit_ledger`: user_id, current_credits, last_credit_award_time,
//!   daily_credit_reset_time, daily_recovered_credits
//!
//! Timestamp columns are RFC 3339 TEXT. Every mutating operation runs its
//! whole read-recover-write cycle inside one IMMEDIATE transaction, so the
//! database write lock serializes it against every other store instance on
//! the same file, not just against this process's own connection mutex.
//! That is what keeps concurrent spends honest across gateway processes
//! (and the CLI) sharing the database.

use super::ledger::{self, LedgerRecord, DAILY_BASELINE};
use super::CreditError;
use chrono::{DateTime, Local, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

/// SQLite-backed store for per-user credit ledgers.
pub struct CreditStore {
    conn: Mutex<Connection>,
}

impl CreditStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, CreditError> {
        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety; the busy timeout
        // makes a second writer wait for the lock instead of failing.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credit_ledger (
                user_id TEXT PRIMARY KEY,
                current_credits INTEGER NOT NULL,
                last_credit_award_time TEXT NOT NULL,
                daily_credit_reset_time TEXT NOT NULL,
                daily_recovered_credits INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up a user's record, creating it with defaults on first access.
    ///
    /// Does not run recovery; use [`CreditStore::balance`] for that.
    pub fn get_or_create(&self, user_id: &str) -> Result<LedgerRecord, CreditError> {
        let conn = self.conn.lock();
        match fetch(&conn, user_id)? {
            Some(record) => Ok(record),
            None => insert_defaults(&conn, user_id, Utc::now()),
        }
    }

    /// Current balance for a user: recover, persist, return.
    ///
    /// Every balance read is also a write — recovery is applied and the
    /// record is written back unconditionally.
    pub fn balance(&self, user_id: &str) -> Result<LedgerRecord, CreditError> {
        self.balance_at(user_id, &Local::now())
    }

    /// [`CreditStore::balance`] with an explicit clock.
    pub fn balance_at<Tz: TimeZone>(
        &self,
        user_id: &str,
        now: &DateTime<Tz>,
    ) -> Result<LedgerRecord, CreditError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = refresh(&tx, user_id, now)?;
        tx.commit()?;
        Ok(record)
    }

    /// Spend `amount` credits. Recovery runs first; the spend is rejected
    /// without mutation if the recovered balance is short.
    pub fn deduct(&self, user_id: &str, amount: i64) -> Result<LedgerRecord, CreditError> {
        self.deduct_at(user_id, amount, &Local::now())
    }

    /// [`CreditStore::deduct`] with an explicit clock.
    pub fn deduct_at<Tz: TimeZone>(
        &self,
        user_id: &str,
        amount: i64,
        now: &DateTime<Tz>,
    ) -> Result<LedgerRecord, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount(format!(
                "amount must be a positive integer, got {amount}"
            )));
        }

        let mut conn = self.conn.lock();

        // IMMEDIATE: take the database write lock up front, so the recovery
        // write-back and the decrement below cannot interleave with another
        // instance's deduct on the same file.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let recovered = refresh(&tx, user_id, now)?;

        if recovered.current_credits < amount {
            // Recovery still persists even when the spend is refused.
            tx.commit()?;
            return Err(CreditError::InsufficientCredits {
                required: amount,
                available: recovered.current_credits,
            });
        }

        let updated = tx.execute(
            "UPDATE credit_ledger SET current_credits = current_credits - ?1
             WHERE user_id = ?2 AND current_credits >= ?1",
            params![amount, user_id],
        )?;

        if updated == 0 {
            let available = fetch(&tx, user_id)?.map_or(0, |r| r.current_credits);
            tx.commit()?;
            return Err(CreditError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let record =
            fetch(&tx, user_id)?.ok_or_else(|| CreditError::NotFound(user_id.to_string()))?;
        tx.commit()?;
        Ok(record)
    }

    /// Administrative reset: baseline balance, both timestamps at now,
    /// daily recovery counter cleared.
    pub fn reset(&self, user_id: &str) -> Result<LedgerRecord, CreditError> {
        self.reset_at(user_id, Utc::now())
    }

    /// [`CreditStore::reset`] with an explicit clock.
    pub fn reset_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<LedgerRecord, CreditError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if fetch(&tx, user_id)?.is_none() {
            insert_defaults(&tx, user_id, now)?;
        }

        tx.execute(
            "UPDATE credit_ledger SET
                current_credits = ?1,
                last_credit_award_time = ?2,
                daily_credit_reset_time = ?2,
                daily_recovered_credits = 0
             WHERE user_id = ?3",
            params![DAILY_BASELINE, now.to_rfc3339(), user_id],
        )?;

        let record =
            fetch(&tx, user_id)?.ok_or_else(|| CreditError::NotFound(user_id.to_string()))?;
        tx.commit()?;
        Ok(record)
    }
}

/// Load-or-create, recover, write back. Shared by balance and deduct so a
/// spend always sees a freshly recovered balance. Callers pass a connection
/// with an open transaction; the write-back is only safe under its lock.
fn refresh<Tz: TimeZone>(
    conn: &Connection,
    user_id: &str,
    now: &DateTime<Tz>,
) -> Result<LedgerRecord, CreditError> {
    let existing = match fetch(conn, user_id)? {
        Some(record) => record,
        None => insert_defaults(conn, user_id, now.with_timezone(&Utc))?,
    };

    let recovered = ledger::recover(&existing, now);
    write_back(conn, &recovered)?;
    Ok(recovered)
}

fn fetch(conn: &Connection, user_id: &str) -> Result<Option<LedgerRecord>, CreditError> {
    let record = conn
        .query_row(
            "SELECT user_id, current_credits, last_credit_award_time,
                    daily_credit_reset_time, daily_recovered_credits
             FROM credit_ledger WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(LedgerRecord {
                    user_id: row.get(0)?,
                    current_credits: row.get(1)?,
                    last_credit_award_time: parse_timestamp(2, row.get(2)?)?,
                    daily_credit_reset_time: parse_timestamp(3, row.get(3)?)?,
                    daily_recovered_credits: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn insert_defaults(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<LedgerRecord, CreditError> {
    let record = LedgerRecord::new(user_id, now);

    // DO NOTHING on conflict: another handler may have created the row
    // between our fetch and this insert.
    conn.execute(
        "INSERT INTO credit_ledger (user_id, current_credits, last_credit_award_time,
                                    daily_credit_reset_time, daily_recovered_credits)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id) DO NOTHING",
        params![
            record.user_id,
            record.current_credits,
            record.last_credit_award_time.to_rfc3339(),
            record.daily_credit_reset_time.to_rfc3339(),
            record.daily_recovered_credits,
        ],
    )?;

    fetch(conn, user_id)?.ok_or_else(|| CreditError::NotFound(user_id.to_string()))
}

/// Unconditional write of the mutable fields.
fn write_back(conn: &Connection, record: &LedgerRecord) -> Result<(), CreditError> {
    conn.execute(
        "UPDATE credit_ledger SET
            current_credits = ?1,
            last_credit_award_time = ?2,
            daily_credit_reset_time = ?3,
            daily_recovered_credits = ?4
         WHERE user_id = ?5",
        params![
            record.current_credits,
            record.last_credit_award_time.to_rfc3339(),
            record.daily_credit_reset_time.to_rfc3339(),
            record.daily_recovered_credits,
            record.user_id,
        ],
    )?;
    Ok(())
}

fn parse_timestamp(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::{DAILY_RECOVERY_CAP, MAX_BALANCE};
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, CreditStore) {
        let tmp = TempDir::new().unwrap();
        let store = CreditStore::open(&tmp.path().join("credits.db")).unwrap();
        (tmp, store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 27, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_access_creates_baseline_record() {
        let (_tmp, store) = test_store();

        let record = store.get_or_create("user_a").unwrap();
        assert_eq!(record.user_id, "user_a");
        assert_eq!(record.current_credits, DAILY_BASELINE);
        assert_eq!(record.daily_recovered_credits, 0);
    }

    #[test]
    fn get_or_create_is_stable() {
        let (_tmp, store) = test_store();

        let first = store.get_or_create("user_a").unwrap();
        let second = store.get_or_create("user_a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn balance_applies_recovery_and_persists_it() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.deduct_at("user_a", 4, &t0()).unwrap();

        // Five hours later: 4 whole hours of accrual, capped by the daily budget.
        let later = t0() + Duration::hours(5);
        let recovered = store.balance_at("user_a", &later).unwrap();
        assert_eq!(recovered.current_credits, DAILY_RECOVERY_CAP);
        assert_eq!(recovered.daily_recovered_credits, DAILY_RECOVERY_CAP);

        // The write-back is visible to a plain fetch.
        let reread = store.get_or_create("user_a").unwrap();
        assert_eq!(reread, recovered);
    }

    #[test]
    fn balance_next_day_resets_then_accrues() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.deduct_at("user_a", 4, &t0()).unwrap();

        // 25h later the daily reset restores 4, then 25 elapsed hours grant
        // up to the daily budget on top of it.
        let next_day = t0() + Duration::hours(25);
        let record = store.balance_at("user_a", &next_day).unwrap();
        assert_eq!(record.current_credits, MAX_BALANCE);
        assert_eq!(record.daily_recovered_credits, DAILY_RECOVERY_CAP);
    }

    #[test]
    fn deduct_success_path() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        let record = store.deduct_at("user_a", 2, &t0()).unwrap();
        assert_eq!(record.current_credits, 2);
    }

    #[test]
    fn deduct_insufficient_is_rejected_without_mutation() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.deduct_at("user_a", 3, &t0()).unwrap(); // balance now 1

        let err = store.deduct_at("user_a", 2, &t0()).unwrap_err();
        match err {
            CreditError::InsufficientCredits {
                required,
                available,
            } => {
                assert_eq!(required, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        let record = store.get_or_create("user_a").unwrap();
        assert_eq!(record.current_credits, 1);
    }

    #[test]
    fn deduct_rejects_non_positive_amounts() {
        let (_tmp, store) = test_store();
        store.balance_at("user_a", &t0()).unwrap();

        for amount in [0, -1, -100] {
            let err = store.deduct_at("user_a", amount, &t0()).unwrap_err();
            assert!(matches!(err, CreditError::InvalidAmount(_)), "{amount}: {err}");
        }

        assert_eq!(store.get_or_create("user_a").unwrap().current_credits, 4);
    }

    #[test]
    fn deduct_runs_recovery_first() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.deduct_at("user_a", 4, &t0()).unwrap(); // balance 0

        // Two hours later the spend succeeds off recovered credits alone.
        let later = t0() + Duration::hours(2);
        let record = store.deduct_at("user_a", 1, &later).unwrap();
        assert_eq!(record.current_credits, 1);
        assert_eq!(record.daily_recovered_credits, 2);
    }

    #[test]
    fn reset_restores_baseline() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.deduct_at("user_a", 3, &t0()).unwrap();

        let now = Utc::now();
        let record = store.reset("user_a").unwrap();
        assert_eq!(record.current_credits, DAILY_BASELINE);
        assert_eq!(record.daily_recovered_credits, 0);
        assert!((record.last_credit_award_time - now).num_seconds().abs() < 5);
        assert!((record.daily_credit_reset_time - now).num_seconds().abs() < 5);
    }

    #[test]
    fn reset_creates_missing_record() {
        let (_tmp, store) = test_store();

        let record = store.reset("brand_new_user").unwrap();
        assert_eq!(record.current_credits, DAILY_BASELINE);
    }

    #[test]
    fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("credits.db");

        {
            let store = CreditStore::open(&db_path).unwrap();
            store.balance_at("user_a", &t0()).unwrap();
            store.deduct_at("user_a", 1, &t0()).unwrap();
        }

        let store = CreditStore::open(&db_path).unwrap();
        let record = store.get_or_create("user_a").unwrap();
        assert_eq!(record.current_credits, 3);
        assert_eq!(record.last_credit_award_time, t0());
    }

    #[test]
    fn concurrent_deducts_cannot_both_succeed() {
        let (_tmp, store) = test_store();
        let store = Arc::new(store);

        // Balance exactly equal to the amount each thread tries to spend.
        store.balance_at("user_a", &t0()).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let now = t0();
                std::thread::spawn(move || store.deduct_at("user_a", 4, &now).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);

        let record = store.get_or_create("user_a").unwrap();
        assert_eq!(record.current_credits, 0);
    }

    #[test]
    fn concurrent_deducts_across_instances_cannot_both_succeed() {
        // Two stores on one file stand in for two gateway processes. The
        // in-process mutex does nothing here; only the transaction holds.
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("credits.db");
        let a = Arc::new(CreditStore::open(&db_path).unwrap());
        let b = Arc::new(CreditStore::open(&db_path).unwrap());

        for _ in 0..100 {
            a.reset("user_a").unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
                .into_iter()
                .map(|store| {
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.deduct("user_a", 4).is_ok()
                    })
                })
                .collect();

            let successes = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();
            assert_eq!(successes, 1);
            assert_eq!(a.get_or_create("user_a").unwrap().current_credits, 0);
        }
    }

    #[test]
    fn ledgers_are_isolated_per_user() {
        let (_tmp, store) = test_store();

        store.balance_at("user_a", &t0()).unwrap();
        store.balance_at("user_b", &t0()).unwrap();
        store.deduct_at("user_a", 4, &t0()).unwrap();

        assert_eq!(store.get_or_create("user_a").unwrap().current_credits, 0);
        assert_eq!(store.get_or_create("user_b").unwrap().current_credits, 4);
    }
}
