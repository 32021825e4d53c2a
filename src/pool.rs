use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

use crate::store::{now_unix, Store};
use crate::sync::{self, KeyFiles};

const DAY_SECONDS: i64 = 24 * 60 * 60;
const MINUTE_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Paid => "paid",
        }
    }

    /// Rows written by older builds may carry NULL or junk; they count as free.
    pub fn from_db(s: &str) -> Tier {
        match s {
            "paid" => Tier::Paid,
            _ => Tier::Free,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no API key available (all inactive, suspended, or rate limited)")]
    NoAvailableKeys,
    #[error("key store failure: {0}")]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub cooldown_seconds: i64,
    pub requests_per_minute: i64,
    pub requests_per_day: i64,
    pub max_free_key_failures: i64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300,
            requests_per_minute: 5,
            requests_per_day: 100,
            max_free_key_failures: 6,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TierCounts {
    pub total: i64,
    pub available: i64,
    pub suspended: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TierRequests {
    pub successful: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateCaps {
    pub requests_per_minute: i64,
    pub requests_per_day: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active_keys: i64,
    pub available_keys: i64,
    pub suspended_keys: i64,
    pub key_statistics: BTreeMap<String, TierCounts>,
    pub request_statistics: BTreeMap<String, TierRequests>,
    pub total_successful_requests: i64,
    pub total_failed_requests: i64,
    pub free_key_consecutive_failures: i64,
    pub max_free_key_failures: i64,
    pub rate_limits: RateCaps,
    pub error_distribution: BTreeMap<String, i64>,
}

/// Short identifying prefix for logs. Keys are credentials; never log them
/// whole.
pub fn key_preview(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    if prefix.len() < key.len() {
        format!("{prefix}…")
    } else {
        prefix
    }
}

/// Thread-safe, persistent key registry with tiered selection.
///
/// The SQLite store is the source of truth for all key state. The only
/// in-memory mirror is the free-tier consecutive-failure counter; it is
/// loaded at construction and every update happens in the same critical
/// section as the `global_state` row write, so acquisition decisions always
/// see the committed value.
pub struct KeyPool {
    store: Store,
    files: KeyFiles,
    opts: PoolOptions,
    free_failures: Mutex<i64>,
}

impl KeyPool {
    pub fn new(store: Store, files: KeyFiles, opts: PoolOptions) -> eyre::Result<Self> {
        sync::sync_files_to_store(&store, &files)?;

        let conn = store.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM global_state WHERE key = 'free_key_consecutive_failures'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let free_failures = raw.and_then(|v| v.parse().ok()).unwrap_or(0);

        Self::cleanup(&conn, now_unix())?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        tracing::info!(total_keys = total, free_failures, "key pool initialised");

        Ok(Self {
            store,
            files,
            opts,
            free_failures: Mutex::new(free_failures),
        })
    }

    /// Current value of the free-tier failure counter (mirror read).
    pub fn free_failures(&self) -> i64 {
        *self.mirror()
    }

    fn mirror(&self) -> MutexGuard<'_, i64> {
        self.free_failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Select a usable key and mark it used.
    ///
    /// `preferred` wins whenever it is active, unsuspended, and under both
    /// rate caps, regardless of tier. Otherwise candidates of the target
    /// tier are tried in order of `(consecutive_failures, requests in the
    /// last 24 h, total_requests)`. A fruitless pass over the free tier
    /// falls back to the paid tier once.
    pub fn acquire(&self, preferred: Option<&str>, force_paid: bool) -> Result<String, PoolError> {
        self.acquire_at(preferred, force_paid, now_unix())
    }

    fn acquire_at(
        &self,
        preferred: Option<&str>,
        force_paid: bool,
        now: i64,
    ) -> Result<String, PoolError> {
        let mirror = self.mirror();
        let mut conn = self.store.conn()?;
        Self::cleanup(&conn, now)?;

        let threshold_hit = *mirror >= self.opts.max_free_key_failures;
        if threshold_hit && !force_paid {
            tracing::info!(
                failures = *mirror,
                threshold = self.opts.max_free_key_failures,
                "free tier failure threshold reached; targeting paid keys"
            );
        }
        let use_paid = force_paid || threshold_hit;

        if let Some(pref) = preferred {
            if self.is_available(&conn, pref, now)? {
                Self::mark_used(&mut conn, pref, now)?;
                return Ok(pref.to_string());
            }
        }

        let tiers: &[Tier] = if use_paid {
            &[Tier::Paid]
        } else {
            &[Tier::Free, Tier::Paid]
        };

        for (pass, tier) in tiers.iter().enumerate() {
            if pass > 0 {
                tracing::warn!("no free key available; trying the paid tier");
            }
            for key in self.candidates(&conn, *tier, now)? {
                if Some(key.as_str()) == preferred {
                    continue;
                }
                if self.check_rate_limit(&conn, &key, now)? {
                    Self::mark_used(&mut conn, &key, now)?;
                    return Ok(key);
                }
            }
        }

        Err(PoolError::NoAvailableKeys)
    }

    /// Active, unsuspended keys of one tier, best candidates first.
    fn candidates(&self, conn: &Connection, tier: Tier, now: i64) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT
                 k.key,
                 COALESCE(s.consecutive_failures, 0) AS consecutive_failures,
                 COALESCE(s.total_requests, 0) AS total_requests,
                 (SELECT COUNT(*) FROM rate_limits r
                   WHERE r.key = k.key AND r.request_time > ?1) AS recent_requests
             FROM api_keys k
             LEFT JOIN key_stats s ON s.key = k.key
             WHERE k.is_active = 1
               AND k.key_type = ?2
               AND k.key NOT IN (SELECT key FROM suspended_keys WHERE resume_time > ?3)
             ORDER BY consecutive_failures ASC, recent_requests ASC, total_requests ASC",
        )?;
        let rows = stmt.query_map(params![now - DAY_SECONDS, tier.as_str(), now], |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect()
    }

    fn is_available(&self, conn: &Connection, key: &str, now: i64) -> rusqlite::Result<bool> {
        let active: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM api_keys WHERE key = ?1 AND is_active = 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_none() {
            return Ok(false);
        }

        let suspended: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM suspended_keys WHERE key = ?1 AND resume_time > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        if suspended.is_some() {
            return Ok(false);
        }

        self.check_rate_limit(conn, key, now)
    }

    fn check_rate_limit(&self, conn: &Connection, key: &str, now: i64) -> rusqlite::Result<bool> {
        let minute_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limits WHERE key = ?1 AND request_time > ?2",
            params![key, now - MINUTE_SECONDS],
            |row| row.get(0),
        )?;
        if minute_count >= self.opts.requests_per_minute {
            return Ok(false);
        }

        let day_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limits WHERE key = ?1 AND request_time > ?2",
            params![key, now - DAY_SECONDS],
            |row| row.get(0),
        )?;
        Ok(day_count < self.opts.requests_per_day)
    }

    fn mark_used(conn: &mut Connection, key: &str, now: i64) -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE key_stats
             SET total_requests = total_requests + 1, last_used = ?1
             WHERE key = ?2",
            params![now, key],
        )?;
        tx.execute(
            "INSERT INTO rate_limits (key, request_time) VALUES (?1, ?2)",
            params![key, now],
        )?;
        tx.commit()
    }

    pub fn record_success(&self, key: &str) -> eyre::Result<()> {
        self.record_success_at(key, now_unix())
    }

    fn record_success_at(&self, key: &str, now: i64) -> eyre::Result<()> {
        let mut mirror = self.mirror();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE key_stats
             SET successful_requests = successful_requests + 1,
                 consecutive_failures = 0,
                 last_success = ?1
             WHERE key = ?2",
            params![now, key],
        )?;

        let tier: Option<String> = tx
            .query_row(
                "SELECT key_type FROM api_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let is_free = matches!(tier.as_deref().map(Tier::from_db), Some(Tier::Free));
        if is_free {
            tx.execute(
                "UPDATE global_state SET value = '0'
                 WHERE key = 'free_key_consecutive_failures'",
                [],
            )?;
        }

        tx.commit()?;
        if is_free {
            *mirror = 0;
        }

        tracing::debug!(key = %key_preview(key), "request succeeded");
        Ok(())
    }

    pub fn record_failure(&self, key: &str, error_code: i64) -> eyre::Result<()> {
        self.record_failure_at(key, error_code, now_unix())
    }

    fn record_failure_at(&self, key: &str, error_code: i64, now: i64) -> eyre::Result<()> {
        let mut mirror = self.mirror();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(String, i64, String)> = tx
            .query_row(
                "SELECT COALESCE(s.error_counts, '{}'),
                        COALESCE(s.consecutive_failures, 0),
                        k.key_type
                 FROM key_stats s
                 JOIN api_keys k ON k.key = s.key
                 WHERE s.key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((counts_raw, consecutive, tier)) = row else {
            tracing::warn!(key = %key_preview(key), "failure recorded for unknown key; ignoring");
            return Ok(());
        };

        let mut counts: BTreeMap<String, i64> =
            serde_json::from_str(&counts_raw).unwrap_or_default();
        *counts.entry(error_code.to_string()).or_insert(0) += 1;
        let consecutive = consecutive + 1;

        tx.execute(
            "UPDATE key_stats
             SET failed_requests = failed_requests + 1,
                 consecutive_failures = ?1,
                 last_error_code = ?2,
                 last_error_time = ?3,
                 error_counts = ?4
             WHERE key = ?5",
            params![
                consecutive,
                error_code,
                now,
                serde_json::to_string(&counts)?,
                key
            ],
        )?;

        let mut new_free_failures = None;
        if Tier::from_db(&tier) == Tier::Free {
            let current: String = tx.query_row(
                "SELECT value FROM global_state WHERE key = 'free_key_consecutive_failures'",
                [],
                |row| row.get(0),
            )?;
            let next = current.parse::<i64>().unwrap_or(0) + 1;
            tx.execute(
                "UPDATE global_state SET value = ?1
                 WHERE key = 'free_key_consecutive_failures'",
                params![next.to_string()],
            )?;
            new_free_failures = Some(next);
        }

        tx.commit()?;
        if let Some(next) = new_free_failures {
            *mirror = next;
            tracing::debug!(free_failures = next, "free tier failure counter advanced");
        }

        Ok(())
    }

    /// Exclude a key from selection for the default cooldown.
    pub fn suspend(&self, key: &str) -> eyre::Result<()> {
        self.suspend_for(key, self.opts.cooldown_seconds)
    }

    pub fn suspend_for(&self, key: &str, seconds: i64) -> eyre::Result<()> {
        self.suspend_at(key, seconds, now_unix())
    }

    fn suspend_at(&self, key: &str, seconds: i64, now: i64) -> eyre::Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO suspended_keys (key, resume_time, reason)
             VALUES (?1, ?2, ?3)",
            params![key, now + seconds, format!("suspended for {seconds}s")],
        )?;
        tracing::info!(key = %key_preview(key), seconds, "key suspended");
        Ok(())
    }

    /// Permanently remove a key from the pool and rewrite the tier files.
    /// A second call for the same key is a no-op.
    pub fn invalidate(&self, key: &str) -> eyre::Result<()> {
        let mut conn = self.store.conn()?;

        let tier: Option<String> = conn
            .query_row(
                "SELECT key_type FROM api_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tier) = tier else {
            return Ok(());
        };

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE api_keys SET is_active = 0 WHERE key = ?1",
            params![key],
        )?;
        tx.execute(
            "DELETE FROM suspended_keys WHERE key = ?1",
            params![key],
        )?;
        tx.commit()?;

        sync::rewrite_files_from_store(&self.store, &self.files)?;
        tracing::warn!(key = %key_preview(key), tier, "key permanently removed from the pool");
        Ok(())
    }

    /// Reset the free-tier failure counter to zero (row and mirror).
    pub fn reset_free_failures(&self) -> eyre::Result<()> {
        let mut mirror = self.mirror();
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE global_state SET value = '0'
             WHERE key = 'free_key_consecutive_failures'",
            [],
        )?;
        *mirror = 0;
        tracing::info!("free tier failure counter reset");
        Ok(())
    }

    pub fn tier_of(&self, key: &str) -> eyre::Result<Option<Tier>> {
        let conn = self.store.conn()?;
        let tier: Option<String> = conn
            .query_row(
                "SELECT key_type FROM api_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tier.as_deref().map(Tier::from_db))
    }

    pub fn status(&self) -> eyre::Result<PoolStatus> {
        self.status_at(now_unix())
    }

    fn status_at(&self, now: i64) -> eyre::Result<PoolStatus> {
        let mirror = self.mirror();
        let conn = self.store.conn()?;
        Self::cleanup(&conn, now)?;

        let active_keys: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;

        let available_keys: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys
             WHERE is_active = 1
               AND key NOT IN (SELECT key FROM suspended_keys WHERE resume_time > ?1)",
            params![now],
            |row| row.get(0),
        )?;

        let suspended_keys: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT sk.key)
             FROM suspended_keys sk
             JOIN api_keys k ON k.key = sk.key
             WHERE k.is_active = 1 AND sk.resume_time > ?1",
            params![now],
            |row| row.get(0),
        )?;

        let mut key_statistics = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT key_type,
                        COUNT(*) AS total,
                        COUNT(CASE WHEN key NOT IN
                              (SELECT key FROM suspended_keys WHERE resume_time > ?1)
                              THEN 1 END) AS available
                 FROM api_keys
                 WHERE is_active = 1
                 GROUP BY key_type",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (tier, total, available) = row?;
                key_statistics.insert(
                    tier,
                    TierCounts {
                        total,
                        available,
                        suspended: total - available,
                    },
                );
            }
        }

        let mut request_statistics = BTreeMap::new();
        let mut total_successful_requests = 0;
        let mut total_failed_requests = 0;
        {
            let mut stmt = conn.prepare(
                "SELECT k.key_type,
                        COALESCE(SUM(s.successful_requests), 0),
                        COALESCE(SUM(s.failed_requests), 0)
                 FROM key_stats s
                 JOIN api_keys k ON k.key = s.key
                 WHERE k.is_active = 1
                 GROUP BY k.key_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (tier, successful, failed) = row?;
                total_successful_requests += successful;
                total_failed_requests += failed;
                request_statistics.insert(tier, TierRequests { successful, failed });
            }
        }

        let mut error_distribution: BTreeMap<String, i64> = BTreeMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT error_counts FROM key_stats WHERE error_counts != '{}'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let counts: BTreeMap<String, i64> =
                    serde_json::from_str(&row?).unwrap_or_default();
                for (code, count) in counts {
                    *error_distribution.entry(code).or_insert(0) += count;
                }
            }
        }

        Ok(PoolStatus {
            active_keys,
            available_keys,
            suspended_keys,
            key_statistics,
            request_statistics,
            total_successful_requests,
            total_failed_requests,
            free_key_consecutive_failures: *mirror,
            max_free_key_failures: self.opts.max_free_key_failures,
            rate_limits: RateCaps {
                requests_per_minute: self.opts.requests_per_minute,
                requests_per_day: self.opts.requests_per_day,
            },
            error_distribution,
        })
    }

    /// Drop expired suspensions and rate-limit rows older than 24 hours.
    /// Runs at the start of `acquire` and `status`.
    fn cleanup(conn: &Connection, now: i64) -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM suspended_keys WHERE resume_time <= ?1",
            params![now],
        )?;
        conn.execute(
            "DELETE FROM rate_limits WHERE request_time < ?1",
            params![now - DAY_SECONDS],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const T: i64 = 1_700_000_000;

    fn pool_with(dir: &TempDir, free: &[&str], paid: &[&str], opts: PoolOptions) -> KeyPool {
        let files = KeyFiles::in_dir(dir.path());
        fs::write(&files.free, free.join("\n") + "\n").unwrap();
        fs::write(&files.paid, paid.join("\n") + "\n").unwrap();
        let store = Store::open(dir.path().join("api_keys.db")).unwrap();
        KeyPool::new(store, files, opts).unwrap()
    }

    fn stat(pool: &KeyPool, key: &str, column: &str) -> i64 {
        let conn = pool.store.conn().unwrap();
        conn.query_row(
            &format!("SELECT COALESCE({column}, 0) FROM key_stats WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn acquire_marks_key_used() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        let key = pool.acquire_at(None, false, T).unwrap();
        assert_eq!(key, "F1");
        assert_eq!(stat(&pool, "F1", "total_requests"), 1);
        assert_eq!(stat(&pool, "F1", "last_used"), T);

        let rate_rows: i64 = pool
            .store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM rate_limits WHERE key = 'F1' AND request_time = ?1",
                params![T],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rate_rows, 1);
    }

    #[test]
    fn acquire_prefers_fewer_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2"], &[], PoolOptions::default());

        pool.record_failure_at("F1", 500, T).unwrap();
        let key = pool.acquire_at(None, false, T + 1).unwrap();
        assert_eq!(key, "F2");
    }

    #[test]
    fn preferred_key_wins_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2", "F3"], &[], PoolOptions::default());

        let key = pool.acquire_at(Some("F2"), false, T).unwrap();
        assert_eq!(key, "F2");
        assert_eq!(stat(&pool, "F2", "total_requests"), 1);
        assert_eq!(stat(&pool, "F1", "total_requests"), 0);
    }

    #[test]
    fn preferred_key_is_returned_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &["P1"], PoolOptions::default());

        // Target tier would be free, but an available paid preferred wins.
        let key = pool.acquire_at(Some("P1"), false, T).unwrap();
        assert_eq!(key, "P1");
    }

    #[test]
    fn suspended_preferred_key_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2"], &[], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        let key = pool.acquire_at(Some("F1"), false, T).unwrap();
        assert_eq!(key, "F2");
    }

    #[test]
    fn failure_accounting_matches_error_counts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.record_failure_at("F1", 500, T).unwrap();
        pool.record_failure_at("F1", 429, T + 1).unwrap();
        pool.record_failure_at("F1", 500, T + 2).unwrap();

        assert_eq!(stat(&pool, "F1", "failed_requests"), 3);
        assert_eq!(stat(&pool, "F1", "consecutive_failures"), 3);
        assert_eq!(stat(&pool, "F1", "last_error_code"), 500);
        assert_eq!(stat(&pool, "F1", "last_error_time"), T + 2);

        let counts_raw: String = pool
            .store
            .conn()
            .unwrap()
            .query_row(
                "SELECT error_counts FROM key_stats WHERE key = 'F1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let counts: BTreeMap<String, i64> = serde_json::from_str(&counts_raw).unwrap();
        assert_eq!(counts.get("500"), Some(&2));
        assert_eq!(counts.get("429"), Some(&1));
        assert_eq!(counts.values().sum::<i64>(), stat(&pool, "F1", "failed_requests"));
    }

    #[test]
    fn success_resets_consecutive_failures_and_free_counter() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.record_failure_at("F1", 500, T).unwrap();
        pool.record_failure_at("F1", 500, T + 1).unwrap();
        assert_eq!(pool.free_failures(), 2);

        pool.record_success_at("F1", T + 2).unwrap();
        assert_eq!(stat(&pool, "F1", "consecutive_failures"), 0);
        assert_eq!(stat(&pool, "F1", "successful_requests"), 1);
        assert_eq!(stat(&pool, "F1", "last_success"), T + 2);
        assert_eq!(pool.free_failures(), 0);
    }

    #[test]
    fn failure_on_unknown_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());
        pool.record_failure_at("GHOST", 500, T).unwrap();
        assert_eq!(pool.free_failures(), 0);
    }

    #[test]
    fn free_counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let files = KeyFiles::in_dir(dir.path());
        fs::write(&files.free, "F1\n").unwrap();
        fs::write(&files.paid, "").unwrap();

        {
            let store = Store::open(dir.path().join("api_keys.db")).unwrap();
            let pool = KeyPool::new(store, files.clone(), PoolOptions::default()).unwrap();
            pool.record_failure_at("F1", 500, T).unwrap();
            pool.record_failure_at("F1", 500, T + 1).unwrap();
        }

        let store = Store::open(dir.path().join("api_keys.db")).unwrap();
        let pool = KeyPool::new(store, files, PoolOptions::default()).unwrap();
        assert_eq!(pool.free_failures(), 2);
    }

    #[test]
    fn tier_switch_on_sustained_free_failures() {
        let dir = tempfile::tempdir().unwrap();
        let opts = PoolOptions {
            max_free_key_failures: 2,
            ..PoolOptions::default()
        };
        let pool = pool_with(&dir, &["F1", "F2"], &["P1"], opts);

        let k1 = pool.acquire_at(None, false, T).unwrap();
        assert!(k1.starts_with('F'));
        pool.record_failure_at(&k1, 500, T + 1).unwrap();
        pool.suspend_at(&k1, 300, T + 1).unwrap();
        assert_eq!(pool.free_failures(), 1);

        let k2 = pool.acquire_at(None, false, T + 2).unwrap();
        assert!(k2.starts_with('F'));
        assert_ne!(k2, k1);
        pool.record_failure_at(&k2, 500, T + 3).unwrap();
        pool.suspend_at(&k2, 300, T + 3).unwrap();
        assert_eq!(pool.free_failures(), 2);

        // Threshold reached: paid tier is targeted without force_paid.
        let k3 = pool.acquire_at(None, false, T + 4).unwrap();
        assert_eq!(k3, "P1");

        // A paid success never resets the free counter.
        pool.record_success_at("P1", T + 5).unwrap();
        assert_eq!(pool.free_failures(), 2);

        let k4 = pool.acquire_at(None, false, T + 70).unwrap();
        assert_eq!(k4, "P1");
    }

    #[test]
    fn free_exhaustion_falls_back_to_paid_without_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &["P1"], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        let key = pool.acquire_at(None, false, T + 1).unwrap();
        assert_eq!(key, "P1");
        assert_eq!(pool.free_failures(), 0);
    }

    #[test]
    fn force_paid_does_not_fall_back_to_free() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        let err = pool.acquire_at(None, true, T).unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableKeys));
    }

    #[test]
    fn minute_cap_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        for i in 0..5 {
            pool.acquire_at(None, false, T + i).unwrap();
        }
        let err = pool.acquire_at(None, false, T + 59).unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableKeys));

        // The first acquisition ages out of the minute window.
        let key = pool.acquire_at(None, false, T + 61).unwrap();
        assert_eq!(key, "F1");
    }

    #[test]
    fn day_cap_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let opts = PoolOptions {
            requests_per_day: 2,
            ..PoolOptions::default()
        };
        let pool = pool_with(&dir, &["F1"], &[], opts);

        pool.acquire_at(None, false, T).unwrap();
        pool.record_success_at("F1", T + 1).unwrap();
        pool.acquire_at(None, false, T + 70).unwrap();
        pool.record_success_at("F1", T + 71).unwrap();

        let err = pool.acquire_at(None, false, T + 140).unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableKeys));

        // Both acquisition rows age past 24 h.
        let key = pool.acquire_at(None, false, T + DAY_SECONDS + 71).unwrap();
        assert_eq!(key, "F1");
    }

    #[test]
    fn suspension_window_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        assert!(matches!(
            pool.acquire_at(None, false, T + 299),
            Err(PoolError::NoAvailableKeys)
        ));

        let key = pool.acquire_at(None, false, T + 301).unwrap();
        assert_eq!(key, "F1");
    }

    #[test]
    fn suspend_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        pool.suspend_at("F1", 600, T).unwrap();

        let (rows, resume): (i64, i64) = pool
            .store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*), MAX(resume_time) FROM suspended_keys WHERE key = 'F1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(resume, T + 600);
    }

    #[test]
    fn invalidate_removes_key_and_rewrites_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2"], &[], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        pool.invalidate("F1").unwrap();

        assert_eq!(fs::read_to_string(&pool.files.free).unwrap(), "F2\n");
        let conn = pool.store.conn().unwrap();
        let active: i64 = conn
            .query_row(
                "SELECT is_active FROM api_keys WHERE key = 'F1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active, 0);
        let suspended: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM suspended_keys WHERE key = 'F1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(suspended, 0);

        let key = pool.acquire_at(None, false, T + 1).unwrap();
        assert_eq!(key, "F2");

        // Second invalidation changes nothing.
        pool.invalidate("F1").unwrap();
        assert_eq!(fs::read_to_string(&pool.files.free).unwrap(), "F2\n");
    }

    #[test]
    fn cleanup_evicts_stale_rate_rows_on_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO rate_limits (key, request_time) VALUES ('F1', ?1)",
                params![T - DAY_SECONDS - 100],
            )
            .unwrap();

        pool.acquire_at(None, false, T).unwrap();

        let stale: i64 = pool
            .store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM rate_limits WHERE request_time < ?1",
                params![T - DAY_SECONDS],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);
    }

    #[test]
    fn status_reports_counts_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2"], &["P1"], PoolOptions::default());

        pool.record_failure_at("F1", 429, T).unwrap();
        pool.record_failure_at("P1", 500, T + 1).unwrap();
        pool.record_success_at("F2", T + 2).unwrap();
        pool.suspend_at("F1", 300, T + 2).unwrap();

        let status = pool.status_at(T + 3).unwrap();
        assert_eq!(status.active_keys, 3);
        assert_eq!(status.available_keys, 2);
        assert_eq!(status.suspended_keys, 1);

        let free = &status.key_statistics["free"];
        assert_eq!((free.total, free.available, free.suspended), (2, 1, 1));
        let paid = &status.key_statistics["paid"];
        assert_eq!((paid.total, paid.available, paid.suspended), (1, 1, 0));

        assert_eq!(status.total_successful_requests, 1);
        assert_eq!(status.total_failed_requests, 2);
        assert_eq!(status.error_distribution.get("429"), Some(&1));
        assert_eq!(status.error_distribution.get("500"), Some(&1));
        assert_eq!(status.rate_limits.requests_per_minute, 5);

        // F2's success reset the free-tier counter after F1's failure.
        assert_eq!(status.free_key_consecutive_failures, 0);
    }

    #[test]
    fn status_after_resume_point_reflects_cleanup_only() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1", "F2"], &[], PoolOptions::default());

        pool.suspend_at("F1", 300, T).unwrap();
        let before = pool.status_at(T + 10).unwrap();
        assert_eq!(before.available_keys, 1);
        assert_eq!(before.suspended_keys, 1);

        let after = pool.status_at(T + 301).unwrap();
        assert_eq!(after.available_keys, 2);
        assert_eq!(after.suspended_keys, 0);
        assert_eq!(after.total_successful_requests, before.total_successful_requests);
        assert_eq!(after.total_failed_requests, before.total_failed_requests);
    }

    #[test]
    fn reset_free_failures_clears_row_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["F1"], &[], PoolOptions::default());

        pool.record_failure_at("F1", 500, T).unwrap();
        assert_eq!(pool.free_failures(), 1);

        pool.reset_free_failures().unwrap();
        assert_eq!(pool.free_failures(), 0);

        let raw: String = pool
            .store
            .conn()
            .unwrap()
            .query_row(
                "SELECT value FROM global_state WHERE key = 'free_key_consecutive_failures'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, "0");
    }

    #[test]
    fn key_preview_truncates() {
        assert_eq!(key_preview("AIzaSyDummyKeyValue"), "AIzaSyDu…");
        assert_eq!(key_preview("short"), "short");
    }
}
