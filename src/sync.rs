use eyre::{eyre, Result};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use crate::pool::Tier;
use crate::store::{now_unix, Store};

/// Locations of the two plain-text tier files.
#[derive(Debug, Clone)]
pub struct KeyFiles {
    pub free: PathBuf,
    pub paid: PathBuf,
}

impl KeyFiles {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            free: dir.join("freekey.txt"),
            paid: dir.join("paidkey.txt"),
        }
    }

    pub fn path_for(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Free => &self.free,
            Tier::Paid => &self.paid,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added_free: usize,
    pub added_paid: usize,
    pub retyped: usize,
    pub deactivated: usize,
    /// Tokens listed in both files; the free copy loses and is rewritten out.
    pub cross_duplicates: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        *self != SyncReport::default()
    }
}

/// Reconcile the tier files into the store.
///
/// Missing files are created empty. Blank lines are dropped and duplicates
/// within a file keep their first occurrence. A token listed in both files
/// is removed from the free file, which is rewritten in place.
pub fn sync_files_to_store(store: &Store, files: &KeyFiles) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    let mut free_keys = read_key_file(&files.free)?;
    let paid_keys = read_key_file(&files.paid)?;

    let paid_set: HashSet<&str> = paid_keys.iter().map(String::as_str).collect();
    let before = free_keys.len();
    free_keys.retain(|k| !paid_set.contains(k.as_str()));
    report.cross_duplicates = before - free_keys.len();
    if report.cross_duplicates > 0 {
        tracing::warn!(
            count = report.cross_duplicates,
            "tokens listed in both tier files; keeping the paid entry"
        );
        write_key_file(&files.free, &free_keys)?;
    }

    let mut conn = store
        .conn()
        .map_err(|e| eyre!("failed to open key database for sync: {e}"))?;
    let tx = conn
        .transaction()
        .map_err(|e| eyre!("failed to start sync transaction: {e}"))?;

    let result: rusqlite::Result<()> = (|| {
        // Active rows as the store currently sees them.
        let mut active: HashMap<String, String> = HashMap::new();
        {
            let mut stmt = tx.prepare("SELECT key, key_type FROM api_keys WHERE is_active = 1")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (key, tier): (String, String) = row?;
                active.insert(key, tier);
            }
        }

        let now = now_unix();
        for (keys, tier) in [(&free_keys, Tier::Free), (&paid_keys, Tier::Paid)] {
            for key in keys {
                match active.get(key.as_str()) {
                    None => {
                        let inserted = tx.execute(
                            "INSERT OR IGNORE INTO api_keys (key, key_type, is_active, created_at)
                             VALUES (?1, ?2, 1, ?3)",
                            rusqlite::params![key, tier.as_str(), now],
                        )?;
                        tx.execute(
                            "INSERT OR IGNORE INTO key_stats (key) VALUES (?1)",
                            rusqlite::params![key],
                        )?;
                        if inserted > 0 {
                            match tier {
                                Tier::Free => report.added_free += 1,
                                Tier::Paid => report.added_paid += 1,
                            }
                        }
                    }
                    Some(current) if current != tier.as_str() => {
                        tx.execute(
                            "UPDATE api_keys SET key_type = ?1 WHERE key = ?2",
                            rusqlite::params![tier.as_str(), key],
                        )?;
                        report.retyped += 1;
                    }
                    Some(_) => {}
                }
            }
        }

        // Active rows no longer present in either file are soft-deleted and
        // lose any pending suspension.
        let file_keys: HashSet<&str> = free_keys
            .iter()
            .chain(paid_keys.iter())
            .map(String::as_str)
            .collect();
        for key in active.keys() {
            if !file_keys.contains(key.as_str()) {
                tx.execute(
                    "UPDATE api_keys SET is_active = 0 WHERE key = ?1",
                    rusqlite::params![key],
                )?;
                tx.execute(
                    "DELETE FROM suspended_keys WHERE key = ?1",
                    rusqlite::params![key],
                )?;
                report.deactivated += 1;
            }
        }

        Ok(())
    })();

    result.map_err(|e| eyre!("key sync failed: {e}"))?;
    tx.commit().map_err(|e| eyre!("failed to commit key sync: {e}"))?;

    if report.changed() {
        tracing::info!(
            added_free = report.added_free,
            added_paid = report.added_paid,
            retyped = report.retyped,
            deactivated = report.deactivated,
            cross_duplicates = report.cross_duplicates,
            "key files synced"
        );
    }

    Ok(report)
}

/// Reverse sync: overwrite both tier files with the currently active tokens
/// of each tier, one per line. Called after a key is invalidated.
pub fn rewrite_files_from_store(store: &Store, files: &KeyFiles) -> Result<()> {
    let conn = store
        .conn()
        .map_err(|e| eyre!("failed to open key database for file rewrite: {e}"))?;

    for tier in [Tier::Free, Tier::Paid] {
        let mut stmt = conn
            .prepare(
                "SELECT key FROM api_keys
                 WHERE is_active = 1 AND key_type = ?1
                 ORDER BY rowid",
            )
            .map_err(|e| eyre!("failed to query active keys: {e}"))?;
        let keys: Vec<String> = stmt
            .query_map([tier.as_str()], |row| row.get(0))
            .and_then(|rows| rows.collect())
            .map_err(|e| eyre!("failed to read active keys: {e}"))?;
        write_key_file(files.path_for(tier), &keys)?;
    }

    Ok(())
}

fn read_key_file(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "key file missing; creating it empty");
        fs::write(path, "")
            .map_err(|e| eyre!("failed to create key file {}: {e}", path.display()))?;
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| eyre!("failed to read key file {}: {e}", path.display()))?;

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for line in raw.lines() {
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        if seen.insert(token.to_string()) {
            keys.push(token.to_string());
        }
    }
    Ok(keys)
}

fn write_key_file(path: &Path, keys: &[String]) -> Result<()> {
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('\n');
    }
    fs::write(path, out).map_err(|e| eyre!("failed to write key file {}: {e}", path.display()))
}
