//! Layered cache for API responses
//!
//! Resolution order is memory, peers, disk, then the origin. Every layer
//! stores [`CacheEntry`] values whose content hash is checked on the way out.

pub mod api;
pub mod key;
pub mod local;
pub mod memory;
pub mod storage;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{ContentAddresser, ContentHash};

/// TTL policy per operation type.
///
/// This is configuration data: operators retune freshness in the config file.
/// The defaults reflect churn: listings move slowly, statuses move fast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// TTL for operations without an entry
    #[serde(default = "default_ttl_secs")]
    pub default_secs: u64,

    /// Operation type -> TTL in seconds
    #[serde(default = "default_operations")]
    pub operations: BTreeMap<String, u64>,
}

fn default_ttl_secs() -> u64 {
    5 * 60
}

fn default_operations() -> BTreeMap<String, u64> {
    [
        // Slow-changing listings
        ("list_repos", 10 * 60),
        ("list_branches", 10 * 60),
        ("list_workflows", 10 * 60),
        ("list_languages", 10 * 60),
        ("list_contributors", 10 * 60),
        // Moderate
        ("get_repo", 5 * 60),
        ("get_commit", 5 * 60),
        ("list_pulls", 5 * 60),
        ("get_pull", 5 * 60),
        ("list_pull_files", 5 * 60),
        ("get_content", 5 * 60),
        ("list_code_scanning_alerts", 5 * 60),
        // Fast-changing status
        ("list_workflow_runs", 2 * 60),
        ("get_workflow_run", 2 * 60),
        ("list_check_runs", 2 * 60),
        ("get_combined_status", 60),
        ("get_rate_limit", 60),
    ]
    .into_iter()
    .map(|(op, secs)| (op.to_string(), secs))
    .collect()
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_secs: default_ttl_secs(),
            operations: default_operations(),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, operation: &str) -> Duration {
        let secs = self
            .operations
            .get(operation)
            .copied()
            .unwrap_or(self.default_secs);
        Duration::from_secs(secs)
    }

    /// Longest TTL in the table; bounds staleness after an invalidation
    pub fn max_ttl(&self) -> Duration {
        let max = self
            .operations
            .values()
            .copied()
            .chain(std::iter::once(self.default_secs))
            .max()
            .unwrap_or(self.default_secs);
        Duration::from_secs(max)
    }
}

/// How far a peer's clock may run ahead of ours
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Layer an entry was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    Memory,
    Peer,
    Disk,
    Origin,
}

/// A cached value with its integrity hash and freshness window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub content_hash: ContentHash,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u32,
    pub origin: EntryOrigin,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Duration,
        now: DateTime<Utc>,
        origin: EntryOrigin,
    ) -> Self {
        let content_hash = ContentAddresser::hash(&value);
        Self {
            key: key.into(),
            value,
            content_hash,
            created_at: now,
            ttl_seconds: u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX),
            origin,
        }
    }

    /// `created_at + ttl`; `None` past the representable range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .checked_add_signed(chrono::Duration::seconds(i64::from(self.ttl_seconds)))
    }

    /// Stale once `now` is past `created_at + ttl`; the boundary second is still fresh.
    /// An entry whose expiry cannot be represented counts as stale.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_none_or(|at| now > at)
    }

    /// Hold an entry received from a peer to local freshness rules.
    ///
    /// `created_at` may lead `now` by at most [`MAX_CLOCK_SKEW_SECS`], and the
    /// TTL is cut to `max_ttl`, so a peer can never stretch staleness past
    /// what a local origin fetch would allow. `None` if the entry is rejected.
    pub fn admit_from_peer(mut self, now: DateTime<Utc>, max_ttl: Duration) -> Option<Self> {
        let latest = now.checked_add_signed(chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS))?;
        if self.created_at > latest {
            return None;
        }
        let cap = u32::try_from(max_ttl.as_secs()).unwrap_or(u32::MAX);
        self.ttl_seconds = self.ttl_seconds.min(cap);
        Some(self)
    }

    /// Whether the value still matches its declared hash
    pub fn verify(&self) -> bool {
        ContentAddresser::verify(&self.value, &self.content_hash)
    }

    pub fn with_origin(mut self, origin: EntryOrigin) -> Self {
        self.origin = origin;
        self
    }
}

// Re-export main types
pub use api::{ApiCache, CacheStats};
pub use key::cache_key;
pub use local::LocalCache;
pub use memory::MemoryCache;
pub use storage::DiskCache;
