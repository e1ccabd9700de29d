//! SQLite store for scan cache entries and skip counters

use std::collections::BTreeMap;
use std::path::Path;

use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension, params};

use super::ScanCacheEntry;
use crate::content::ContentHash;
use crate::error::ScanError;

/// Schema version - increment to trigger nuke-and-rebuild
const SCHEMA_VERSION: i32 = 1;

type Result<T> = std::result::Result<T, ScanError>;

pub struct ScanStore {
    conn: Connection,
}

impl ScanStore {
    pub fn open_at(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| ScanError::Storage(format!("Failed to create scan dir: {}", e)))?;

        let db_path = dir.join("scans.db");
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(2))?;

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap_or(0);

        if version != 0 && version != SCHEMA_VERSION {
            log::info!(
                "Scan store schema version mismatch ({} != {}), rebuilding",
                version,
                SCHEMA_VERSION
            );
            drop(conn);
            std::fs::remove_file(&db_path)
                .map_err(|e| ScanError::Storage(format!("Failed to remove {}: {}", db_path.display(), e)))?;
            return Self::open_at(dir);
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scan_entries (
                repo TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                result_ref TEXT NOT NULL,
                file_hashes TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (repo, config_hash)
            );

            CREATE TABLE IF NOT EXISTS scan_counters (
                name TEXT PRIMARY KEY NOT NULL,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self { conn })
    }

    /// Latest entry for `(repo, config_hash)`
    pub fn latest(&self, repo: &str, config_hash: &ContentHash) -> Result<Option<ScanCacheEntry>> {
        type Row = (String, String, String, i64);

        let row: Option<Row> = self
            .conn
            .query_row(
                "SELECT commit_sha, result_ref, file_hashes, created_at
                 FROM scan_entries WHERE repo = ?1 AND config_hash = ?2",
                params![repo, config_hash.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((commit_sha, result_ref, file_hashes, created_at)) = row else {
            return Ok(None);
        };

        let file_hashes: BTreeMap<String, ContentHash> = serde_json::from_str(&file_hashes)
            .map_err(|e| ScanError::Storage(format!("corrupt file hashes for {}: {}", repo, e)))?;
        let created_at = DateTime::from_timestamp(created_at, 0)
            .ok_or_else(|| ScanError::Storage(format!("bad timestamp for {}", repo)))?;

        Ok(Some(ScanCacheEntry {
            repo: repo.to_string(),
            config_hash: config_hash.clone(),
            commit_sha,
            result_ref,
            file_hashes,
            created_at,
        }))
    }

    /// Insert, replacing any entry with the same repo and config hash
    pub fn put(&self, entry: &ScanCacheEntry) -> Result<()> {
        let file_hashes = serde_json::to_string(&entry.file_hashes)
            .map_err(|e| ScanError::Storage(e.to_string()))?;

        self.conn.execute(
            "INSERT OR REPLACE INTO scan_entries
             (repo, config_hash, commit_sha, result_ref, file_hashes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.repo,
                entry.config_hash.to_string(),
                entry.commit_sha,
                entry.result_ref,
                file_hashes,
                entry.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scan_entries", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn bump(&self, counter: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scan_counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![counter],
        )?;
        Ok(())
    }

    pub fn counter(&self, counter: &str) -> Result<u64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM scan_counters WHERE name = ?1",
                params![counter],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentAddresser;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(commit: &str) -> ScanCacheEntry {
        ScanCacheEntry {
            repo: "org/app".to_string(),
            config_hash: ContentAddresser::hash(b"config"),
            commit_sha: commit.to_string(),
            result_ref: format!("sarif/{}.json", commit),
            file_hashes: BTreeMap::from([("src/main.rs".to_string(), ContentAddresser::hash(b"fn main() {}"))]),
            created_at: DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap(),
        }
    }

    #[test]
    fn test_put_then_latest() {
        let dir = TempDir::new().unwrap();
        let store = ScanStore::open_at(dir.path()).unwrap();
        let e = entry("abc123");

        store.put(&e).unwrap();

        let got = store.latest("org/app", &e.config_hash).unwrap().unwrap();
        assert_eq!(got, e);
    }

    #[test]
    fn test_newer_entry_supersedes() {
        let dir = TempDir::new().unwrap();
        let store = ScanStore::open_at(dir.path()).unwrap();

        store.put(&entry("abc123")).unwrap();
        store.put(&entry("def456")).unwrap();

        let latest = store.latest("org/app", &ContentAddresser::hash(b"config")).unwrap().unwrap();
        assert_eq!(latest.commit_sha, "def456");
        assert_eq!(store.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_counters_persist_across_handles() {
        let dir = TempDir::new().unwrap();
        {
            let store = ScanStore::open_at(dir.path()).unwrap();
            store.bump("scans_run").unwrap();
            store.bump("scans_run").unwrap();
        }
        let store = ScanStore::open_at(dir.path()).unwrap();
        assert_eq!(store.counter("scans_run").unwrap(), 2);
        assert_eq!(store.counter("scans_skipped").unwrap(), 0);
    }
}
