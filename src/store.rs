use eyre::{eyre, Result};
use rusqlite::Connection;
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

/// Owner of the key database file.
///
/// Connections are short-lived: every operation opens one, runs to a commit
/// and drops it. SQLite serialises writers itself, so the handle is cheap to
/// share across request tasks.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open the database, creating and migrating the schema as needed.
    /// Safe to call against a database produced by an older build.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    eyre!("failed to create data directory {}: {e}", parent.display())
                })?;
            }
        }

        let store = Self { path };
        store
            .init_schema()
            .map_err(|e| eyre!("failed to initialise key database: {e}"))?;
        Ok(store)
    }

    pub fn conn(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                key TEXT PRIMARY KEY,
                key_type TEXT DEFAULT 'free',
                is_active INTEGER DEFAULT 1,
                created_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS key_stats (
                key TEXT PRIMARY KEY,
                total_requests INTEGER DEFAULT 0,
                successful_requests INTEGER DEFAULT 0,
                failed_requests INTEGER DEFAULT 0,
                consecutive_failures INTEGER DEFAULT 0,
                last_used INTEGER,
                last_success INTEGER,
                last_error_code INTEGER,
                last_error_time INTEGER,
                error_counts TEXT DEFAULT '{}',
                FOREIGN KEY (key) REFERENCES api_keys(key)
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT,
                request_time INTEGER,
                FOREIGN KEY (key) REFERENCES api_keys(key)
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limits_key_time
                ON rate_limits(key, request_time);

            CREATE TABLE IF NOT EXISTS suspended_keys (
                key TEXT PRIMARY KEY,
                resume_time INTEGER,
                reason TEXT,
                FOREIGN KEY (key) REFERENCES api_keys(key)
            );

            CREATE TABLE IF NOT EXISTS global_state (
                key TEXT PRIMARY KEY,
                value TEXT
            );",
        )?;

        // Databases created before tiering existed lack these columns.
        // Each step checks column presence first so re-running is a no-op.
        if !column_exists(&conn, "api_keys", "key_type")? {
            conn.execute(
                "ALTER TABLE api_keys ADD COLUMN key_type TEXT DEFAULT 'free'",
                [],
            )?;
            tracing::info!("migrated api_keys: added key_type column");
        }
        if !column_exists(&conn, "key_stats", "consecutive_failures")? {
            conn.execute(
                "ALTER TABLE key_stats ADD COLUMN consecutive_failures INTEGER DEFAULT 0",
                [],
            )?;
            tracing::info!("migrated key_stats: added consecutive_failures column");
        }

        conn.execute(
            "INSERT OR IGNORE INTO global_state (key, value)
             VALUES ('free_key_consecutive_failures', '0')",
            [],
        )?;

        Ok(())
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
