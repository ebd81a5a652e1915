//! Shared fixed-window rate limiter.
//!
//! Counters live in SQLite rather than process memory, so every service
//! instance sharing the database file enforces one combined budget per
//! client key. Windows are aligned to multiples of the window length; a
//! check is a single atomic conditional upsert, and only allowed requests
//! consume budget.
//!
//! ## Design
//! - `rate_windows` table keyed by (client key, window start)
//! - Expired windows swept on a 5-minute interval, not on every check
//! - A limit of 0 disables limiting entirely

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// How often expired window rows are swept from the table.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Current epoch seconds.
fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window (0 if blocked).
    pub remaining: u32,
    /// Seconds until the current window rolls over (0 if allowed).
    pub retry_after_secs: u64,
}

/// Fixed-window rate limiter backed by a shared SQLite table.
pub struct SharedRateLimiter {
    conn: Mutex<(Connection, u64)>,
    limit: u32,
    window_secs: u64,
}

impl SharedRateLimiter {
    /// Open (or create) the counter table in the database at `db_path`.
    pub fn open(db_path: &Path, limit: u32, window_secs: u64) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_windows (
                key TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (key, window_start)
            );
            CREATE INDEX IF NOT EXISTS idx_rate_windows_start ON rate_windows(window_start);",
        )?;

        Ok(Self {
            conn: Mutex::new((conn, now_secs())),
            limit,
            window_secs: window_secs.max(1),
        })
    }

    /// Check whether a request from `key` is allowed right now.
    pub fn check(&self, key: &str) -> Result<RateLimitDecision> {
        self.check_at(key, now_secs())
    }

    /// [`SharedRateLimiter::check`] with an explicit clock (epoch seconds).
    pub fn check_at(&self, key: &str, now: u64) -> Result<RateLimitDecision> {
        if self.limit == 0 {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: u32::MAX,
                retry_after_secs: 0,
            });
        }

        let window_start = now - now % self.window_secs;

        let mut guard = self.conn.lock();
        let (conn, last_sweep) = &mut *guard;

        // Periodic sweep: drop windows that can no longer affect a decision.
        if now.saturating_sub(*last_sweep) >= SWEEP_INTERVAL_SECS {
            conn.execute(
                "DELETE FROM rate_windows WHERE window_start < ?1",
                params![window_start as i64],
            )?;
            *last_sweep = now;
        }

        // Atomic conditional upsert: the increment only lands while the
        // window has budget, so blocked requests consume nothing. A full
        // window makes the DO UPDATE a no-op and RETURNING yields no row.
        let count: Option<i64> = conn
            .query_row(
                "INSERT INTO rate_windows (key, window_start, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(key, window_start) DO UPDATE SET count = count + 1
                     WHERE count < ?3
                 RETURNING count",
                params![key, window_start as i64, i64::from(self.limit)],
                |row| row.get(0),
            )
            .optional()?;

        match count {
            Some(count) => Ok(RateLimitDecision {
                allowed: true,
                remaining: self.limit - u32::try_from(count).unwrap_or(self.limit),
                retry_after_secs: 0,
            }),
            None => Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: (window_start + self.window_secs).saturating_sub(now),
            }),
        }
    }
}
