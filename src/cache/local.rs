//! The process-local layers (memory and disk) behind one handle.
//!
//! `ApiCache` reads and writes through this, and the peer server answers
//! remote `get` requests from it without re-entering the cascade.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::storage::{ClearStats, DiskStats};
use super::{CacheEntry, DiskCache, EntryOrigin, MemoryCache};
use crate::clock::Clock;
use crate::error::CacheError;

pub struct LocalCache {
    memory: Option<MemoryCache>,
    disk: Option<Mutex<DiskCache>>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(memory: Option<MemoryCache>, disk: Option<DiskCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory,
            disk: disk.map(Mutex::new),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn has_disk(&self) -> bool {
        self.disk.is_some()
    }

    pub fn memory_get(&self, key: &str) -> Option<CacheEntry> {
        let memory = self.memory.as_ref()?;
        memory
            .get(key, self.now())
            .map(|e| e.with_origin(EntryOrigin::Memory))
    }

    /// Disk lookup; storage errors are logged and read as a miss
    pub fn disk_get(&self, key: &str) -> Option<CacheEntry> {
        let disk = self.disk.as_ref()?;
        let guard = disk.lock().ok()?;
        match guard.get(key, self.now()) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Disk cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Memory first, then disk. Used when serving peers.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.memory_get(key).or_else(|| self.disk_get(key))
    }

    pub fn store_memory(&self, entry: &CacheEntry) {
        if let Some(ref memory) = self.memory {
            memory.insert(entry.clone(), self.now());
        }
    }

    pub fn store_disk(&self, entry: &CacheEntry, operation: &str) {
        if let Some(ref disk) = self.disk
            && let Ok(guard) = disk.lock()
            && let Err(e) = guard.put(entry, operation)
        {
            log::warn!("Disk cache write failed for {}: {}", entry.key, e);
        }
    }

    /// Write through to both layers
    pub fn store(&self, entry: &CacheEntry, operation: &str) {
        self.store_memory(entry);
        self.store_disk(entry, operation);
    }

    /// Remove from both layers; true if either held the key
    pub fn remove(&self, key: &str) -> bool {
        let in_memory = self.memory.as_ref().is_some_and(|m| m.remove(key));
        let on_disk = match self.disk.as_ref().and_then(|d| d.lock().ok()) {
            Some(guard) => guard.delete_by_key(key).unwrap_or_else(|e| {
                log::warn!("Disk cache delete failed for {}: {}", key, e);
                false
            }),
            None => false,
        };
        in_memory || on_disk
    }

    /// Evict expired entries from both layers
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let mut removed = self.memory.as_ref().map_or(0, |m| m.sweep(now));
        if let Some(guard) = self.disk.as_ref().and_then(|d| d.lock().ok()) {
            match guard.purge_expired(now) {
                Ok(n) => removed += n,
                Err(e) => log::warn!("Disk cache purge failed: {}", e),
            }
        }
        removed
    }

    /// Run `sweep` every `interval` until the task is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    log::debug!("Swept {} expired cache entries", removed);
                }
            }
        })
    }

    pub fn memory_len(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.len())
    }

    pub fn disk_stats(&self) -> Result<Option<DiskStats>, CacheError> {
        match self.disk.as_ref() {
            Some(disk) => {
                let guard = disk
                    .lock()
                    .map_err(|_| CacheError::Io("disk cache lock poisoned".to_string()))?;
                guard.stats(self.now()).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<ClearStats, CacheError> {
        if let Some(ref memory) = self.memory {
            memory.clear();
        }
        match self.disk.as_ref() {
            Some(disk) => {
                let guard = disk
                    .lock()
                    .map_err(|_| CacheError::Io("disk cache lock poisoned".to_string()))?;
                guard.clear_all()
            }
            None => Ok(ClearStats { entries_removed: 0 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn local(dir: &TempDir, clock: Arc<ManualClock>) -> LocalCache {
        LocalCache::new(
            Some(MemoryCache::new(100)),
            Some(DiskCache::open_at(dir.path()).unwrap()),
            clock,
        )
    }

    #[test]
    fn test_store_and_lookup_both_layers() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = local(&dir, clock.clone());

        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(60), clock.now(), EntryOrigin::Origin);
        cache.store(&entry, "get_repo");

        assert_eq!(cache.memory_get("k").unwrap().origin, EntryOrigin::Memory);
        assert_eq!(cache.disk_get("k").unwrap().origin, EntryOrigin::Disk);
    }

    #[test]
    fn test_remove_clears_both_layers() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = local(&dir, clock.clone());

        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(60), clock.now(), EntryOrigin::Origin);
        cache.store(&entry, "get_repo");

        assert!(cache.remove("k"));
        assert!(cache.lookup("k").is_none());
    }

    #[test]
    fn test_sweep_counts_both_layers() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = local(&dir, clock.clone());

        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(10), clock.now(), EntryOrigin::Origin);
        cache.store(&entry, "op");
        clock.advance(Duration::from_secs(11));

        assert_eq!(cache.sweep(), 2);
    }

    #[test]
    fn test_clear_empties_everything() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = local(&dir, clock.clone());

        let entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(60), clock.now(), EntryOrigin::Origin);
        cache.store(&entry, "op");

        assert_eq!(cache.clear().unwrap().entries_removed, 1);
        assert_eq!(cache.memory_len(), 0);
    }
}
