//! In-process memory layer.
//!
//! A single map-level mutex guards the entries; contention is low and every
//! critical section is a plain map operation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::CacheEntry;

pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fresh, verified entry for `key`. Expired or corrupt entries are evicted.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;

        if entry.is_expired(now) {
            log::debug!("Memory entry expired: {}", key);
            entries.remove(key);
            return None;
        }
        if !entry.verify() {
            log::warn!("Memory entry failed hash verification, evicting: {}", key);
            entries.remove(key);
            return None;
        }

        Some(entry.clone())
    }

    /// Insert or replace. At capacity, expired entries go first, then the oldest.
    pub fn insert(&self, entry: CacheEntry, now: DateTime<Utc>) {
        let mut entries = self.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(&entry.key) {
            entries.retain(|_, e| !e.is_expired(now));

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(entry.key.clone(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
