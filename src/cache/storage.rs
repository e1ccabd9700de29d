//! SQLite-based disk layer with file blob support
//!
//! Stores small values inline in SQLite, large values (>10KB) as files. Several
//! runner processes on one host may share the directory: every read re-checks
//! the content hash and TTL, so a stale or torn write is simply a miss.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::{CacheEntry, EntryOrigin};
use crate::content::ContentHash;
use crate::error::CacheError;
use crate::files::{SHARED_READ, write_atomic};

/// Schema version - increment to trigger nuke-and-rebuild
const SCHEMA_VERSION: i32 = 1;

/// Values larger than this are stored as external blobs
const INLINE_THRESHOLD: usize = 10 * 1024; // 10KB

type Result<T> = std::result::Result<T, CacheError>;

/// SQLite-backed disk cache with file blob support
pub struct DiskCache {
    conn: Connection,
    blobs_dir: PathBuf,
}

impl DiskCache {
    /// Default cache directory (~/.cache/fleetcache on Linux)
    pub fn default_dir() -> Result<PathBuf> {
        let cache_base = dirs::cache_dir().ok_or(CacheError::NoHome)?;
        Ok(cache_base.join("fleetcache"))
    }

    /// Open the disk cache at a specific directory
    pub fn open_at(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create cache dir: {}", e)))?;

        let db_path = cache_dir.join("cache.db");
        let blobs_dir = cache_dir.join("blobs");
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create blobs dir: {}", e)))?;

        let conn = Connection::open(&db_path)?;
        // Other runners on the host may hold the write lock briefly
        conn.busy_timeout(std::time::Duration::from_secs(2))?;

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap_or(0);

        if version != 0 && version != SCHEMA_VERSION {
            log::info!(
                "Cache schema version mismatch ({} != {}), rebuilding",
                version,
                SCHEMA_VERSION
            );
            drop(conn);
            Self::nuke(&db_path, &blobs_dir)?;
            return Self::open_at(cache_dir);
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY NOT NULL,
                operation TEXT NOT NULL,
                data BLOB,
                blob_path TEXT,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_expires_at ON cache_entries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_operation ON cache_entries(operation);
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self { conn, blobs_dir })
    }

    /// Fresh, verified entry for `key`, if any
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        type Row = (Option<Vec<u8>>, Option<String>, String, i64, i64);

        let row: Option<Row> = self
            .conn
            .query_row(
                "SELECT data, blob_path, content_hash, created_at, ttl_seconds
                 FROM cache_entries
                 WHERE cache_key = ?1 AND expires_at >= ?2",
                params![key, now.timestamp()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, blob_path, hash, created_at, ttl_seconds)) = row else {
            return Ok(None);
        };

        let value = match (data, blob_path) {
            (Some(data), None) => data,
            (None, Some(blob_path)) => {
                let full_path = self.blobs_dir.join(&blob_path);
                match std::fs::read(&full_path) {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("Failed to read blob {}: {}", blob_path, e);
                        self.delete_by_key(key)?;
                        return Ok(None);
                    }
                }
            }
            _ => return Err(CacheError::Corrupt(format!("entry {} has no data", key))),
        };

        let Ok(content_hash) = hash.parse::<ContentHash>() else {
            log::warn!("Disk entry {} has an unreadable content hash, evicting", key);
            self.delete_by_key(key)?;
            return Ok(None);
        };

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            content_hash,
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or(now),
            ttl_seconds: u32::try_from(ttl_seconds).unwrap_or(0),
            origin: EntryOrigin::Disk,
        };

        if !entry.verify() {
            log::warn!("Disk entry failed hash verification, evicting: {}", key);
            self.delete_by_key(key)?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Store an entry, replacing any previous value for the key
    pub fn put(&self, entry: &CacheEntry, operation: &str) -> Result<()> {
        let created = entry.created_at.timestamp();
        let expires = entry
            .expires_at()
            .ok_or_else(|| CacheError::Corrupt(format!("entry {} expires out of range", entry.key)))?
            .timestamp();
        let hash = entry.content_hash.to_string();
        let previous_blob = self.blob_path_of(&entry.key)?;

        let new_blob = if entry.value.len() <= INLINE_THRESHOLD {
            self.conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (cache_key, operation, data, blob_path, content_hash, created_at, ttl_seconds, expires_at, size_bytes)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.key,
                    operation,
                    entry.value,
                    hash,
                    created,
                    entry.ttl_seconds,
                    expires,
                    entry.value.len()
                ],
            )?;
            None
        } else {
            let blob_path = self.write_blob(&entry.key, &entry.value)?;
            self.conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (cache_key, operation, data, blob_path, content_hash, created_at, ttl_seconds, expires_at, size_bytes)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.key,
                    operation,
                    blob_path,
                    hash,
                    created,
                    entry.ttl_seconds,
                    expires,
                    entry.value.len()
                ],
            )?;
            Some(blob_path)
        };

        if let Some(previous) = previous_blob
            && new_blob.as_ref() != Some(&previous)
        {
            self.remove_blob(&previous);
        }
        Ok(())
    }

    fn blob_path_of(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT blob_path FROM cache_entries WHERE cache_key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?
            .flatten())
    }

    fn remove_blob(&self, blob_path: &str) {
        if let Err(e) = std::fs::remove_file(self.blobs_dir.join(blob_path))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("Failed to remove blob {}: {}", blob_path, e);
        }
    }

    /// Clear all cache entries
    pub fn clear_all(&self) -> Result<ClearStats> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;

        self.conn.execute("DELETE FROM cache_entries", [])?;

        if self.blobs_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.blobs_dir) {
                log::warn!("Failed to clear blobs directory: {}", e);
            }
            std::fs::create_dir_all(&self.blobs_dir)
                .map_err(|e| CacheError::Io(format!("Failed to recreate blobs dir: {}", e)))?;
        }

        Ok(ClearStats {
            entries_removed: count as usize,
        })
    }

    /// Delete a specific cache entry (and its blob) by key
    pub fn delete_by_key(&self, key: &str) -> Result<bool> {
        let blob_path = self.blob_path_of(key)?;

        let deleted = self
            .conn
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", [key])?;

        if let Some(blob_path) = blob_path {
            self.remove_blob(&blob_path);
        }

        Ok(deleted > 0)
    }

    /// Remove rows whose TTL has passed, with their blob files
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = now.timestamp();
        let blobs: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT blob_path FROM cache_entries WHERE expires_at < ?1 AND blob_path IS NOT NULL",
            )?;
            let rows = stmt.query_map([now], |r| r.get(0))?;
            rows.collect::<std::result::Result<Vec<String>, _>>()?
        };

        let deleted = self
            .conn
            .execute("DELETE FROM cache_entries WHERE expires_at < ?1", [now])?;

        for blob_path in &blobs {
            self.remove_blob(blob_path);
        }
        Ok(deleted)
    }

    /// Get cache statistics
    pub fn stats(&self, now: DateTime<Utc>) -> Result<DiskStats> {
        let now = now.timestamp();

        let total_entries: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;

        let valid_entries: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE expires_at >= ?1",
            [now],
            |r| r.get(0),
        )?;

        let total_size: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries",
            [],
            |r| r.get(0),
        )?;

        let oldest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MIN(created_at) FROM cache_entries WHERE expires_at >= ?1",
                [now],
                |r| r.get(0),
            )
            .optional()?
            .flatten();

        let newest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(created_at) FROM cache_entries WHERE expires_at >= ?1",
                [now],
                |r| r.get(0),
            )
            .optional()?
            .flatten();

        Ok(DiskStats {
            total_entries: total_entries as usize,
            valid_entries: valid_entries as usize,
            expired_entries: (total_entries - valid_entries) as usize,
            total_size_bytes: total_size as usize,
            oldest_entry: oldest,
            newest_entry: newest,
        })
    }

    /// Write a blob file, sharded by the first 2 chars of the hashed key
    fn write_blob(&self, key: &str, data: &[u8]) -> Result<String> {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        let shard = &name[..2];
        let shard_dir = self.blobs_dir.join(shard);
        std::fs::create_dir_all(&shard_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create shard dir: {}", e)))?;

        let filename = format!("{}.bin", name);
        let rel_path = format!("{}/{}", shard, filename);
        let full_path = shard_dir.join(&filename);

        // Readers on other runners see the old blob or the new one, never a torn write
        write_atomic(&full_path, data, SHARED_READ)
            .map_err(|e| CacheError::Io(format!("Failed to write blob: {}", e)))?;

        Ok(rel_path)
    }

    /// Nuke the cache (delete DB and all blobs)
    fn nuke(db_path: &Path, blobs_dir: &Path) -> Result<()> {
        if db_path.exists() {
            std::fs::remove_file(db_path)
                .map_err(|e| CacheError::Io(format!("Failed to remove cache DB: {}", e)))?;
        }
        if blobs_dir.exists() {
            std::fs::remove_dir_all(blobs_dir)
                .map_err(|e| CacheError::Io(format!("Failed to remove blobs dir: {}", e)))?;
        }
        Ok(())
    }
}

/// Statistics about cache clear operation
#[derive(Debug)]
pub struct ClearStats {
    pub entries_removed: usize,
}

/// Statistics about disk cache state
#[derive(Debug)]
pub struct DiskStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub total_size_bytes: usize,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
}
