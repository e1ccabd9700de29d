//! Layered API cache: memory, then peers, then disk, then origin.
//!
//! The first verified hit wins. Peer and disk problems are logged and read as
//! misses; only origin errors reach the caller. A full miss is written through
//! to memory and disk and pushed to every live peer in the background.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{CacheEntry, EntryOrigin, LocalCache, TtlPolicy, cache_key};
use crate::error::{OriginError, PeerError};
use crate::origin::{Origin, Params};
use crate::p2p::{PeerInfo, PeerRegistry, PeerTransport};

type QueryFuture = Pin<Box<dyn Future<Output = (PeerInfo, Result<Option<CacheEntry>, PeerError>)> + Send>>;

/// Counters since this cache was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub requests: u64,
    pub memory_hits: u64,
    pub peer_hits: u64,
    pub disk_hits: u64,
    pub origin_calls: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    memory_hits: AtomicU64,
    peer_hits: AtomicU64,
    disk_hits: AtomicU64,
    origin_calls: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            requests: self.requests.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            peer_hits: self.peer_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            origin_calls: self.origin_calls.load(Ordering::Relaxed),
        }
    }
}

struct PeerNetwork {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
}

pub struct ApiCache {
    local: Arc<LocalCache>,
    origin: Arc<dyn Origin>,
    ttl: TtlPolicy,
    peers: Option<PeerNetwork>,
    broadcast_timeout: Duration,
    counters: Counters,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl ApiCache {
    pub fn new(local: Arc<LocalCache>, origin: Arc<dyn Origin>, ttl: TtlPolicy) -> Self {
        Self {
            local,
            origin,
            ttl,
            peers: None,
            broadcast_timeout: Duration::from_secs(1),
            counters: Counters::default(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Enable the peer layer
    pub fn with_peers(mut self, registry: Arc<PeerRegistry>, transport: Arc<dyn PeerTransport>) -> Self {
        self.peers = Some(PeerNetwork { registry, transport });
        self
    }

    pub fn with_broadcast_timeout(mut self, timeout: Duration) -> Self {
        self.broadcast_timeout = timeout;
        self
    }

    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Look up `operation(params)` using the derived cache key
    pub async fn fetch(&self, operation: &str, params: &Params) -> Result<CacheEntry, OriginError> {
        let pairs: Vec<(&String, &String)> = params.iter().collect();
        let key = cache_key(operation, &pairs);
        self.get(&key, operation, params).await
    }

    /// Resolve `key` through the cascade.
    ///
    /// `operation` selects the TTL and, with `params`, is what the origin is
    /// asked for on a full miss. The returned entry's `origin` says which
    /// layer answered.
    pub async fn get(&self, key: &str, operation: &str, params: &Params) -> Result<CacheEntry, OriginError> {
        Counters::bump(&self.counters.requests);

        if let Some(entry) = self.local.memory_get(key) {
            debug!("Memory hit: {}", key);
            Counters::bump(&self.counters.memory_hits);
            return Ok(entry);
        }

        if let Some(entry) = self.query_peers(key, operation).await {
            debug!("Peer hit: {}", key);
            Counters::bump(&self.counters.peer_hits);
            self.local.store_memory(&entry);
            return Ok(entry);
        }

        if let Some(entry) = self.local.disk_get(key) {
            debug!("Disk hit: {}", key);
            Counters::bump(&self.counters.disk_hits);
            self.local.store_memory(&entry);
            return Ok(entry);
        }

        debug!("Miss: {} -> origin ({})", key, operation);
        Counters::bump(&self.counters.origin_calls);
        let value = self.origin.fetch(operation, params).await?;

        let entry = CacheEntry::new(
            key,
            value,
            self.ttl.ttl_for(operation),
            self.local.now(),
            EntryOrigin::Origin,
        );
        self.local.store(&entry, operation);
        self.broadcast(&entry, operation);

        Ok(entry)
    }

    /// Race every live peer; the first verified, unexpired answer wins.
    /// Answers are held to the local TTL for `operation`.
    async fn query_peers(&self, key: &str, operation: &str) -> Option<CacheEntry> {
        let network = self.peers.as_ref()?;

        network.registry.prune();
        let live = network.registry.list_live_peers();
        if live.is_empty() {
            return None;
        }

        let mut queries: FuturesUnordered<QueryFuture> = live
            .into_iter()
            .map(|peer| {
                let transport = network.transport.clone();
                let key = key.to_string();
                Box::pin(async move {
                    let result = transport.query(&peer, &key).await;
                    (peer, result)
                }) as QueryFuture
            })
            .collect();

        while let Some((peer, result)) = queries.next().await {
            match result {
                Ok(Some(entry)) => {
                    if entry.key != key || !entry.verify() {
                        warn!(
                            "Discarding unverifiable response for {} from peer {}",
                            key, peer.peer_id
                        );
                        continue;
                    }
                    network.registry.touch(&peer.peer_id);
                    let now = self.local.now();
                    let Some(entry) = entry.admit_from_peer(now, self.ttl.ttl_for(operation)) else {
                        warn!(
                            "Discarding future-dated {} from peer {}",
                            key, peer.peer_id
                        );
                        continue;
                    };
                    if entry.is_expired(now) {
                        debug!("Peer {} returned an expired {}", peer.peer_id, key);
                        continue;
                    }
                    return Some(entry.with_origin(EntryOrigin::Peer));
                }
                Ok(None) => network.registry.touch(&peer.peer_id),
                Err(e) => debug!("Peer {} query failed: {}", peer.peer_id, e),
            }
        }
        None
    }

    /// Fire-and-forget push of a fresh entry to every live peer
    fn broadcast(&self, entry: &CacheEntry, operation: &str) {
        let Some(ref network) = self.peers else {
            return;
        };

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.retain(|task| !task.is_finished());

        for peer in network.registry.list_live_peers() {
            let transport = network.transport.clone();
            let entry = entry.clone();
            let operation = operation.to_string();
            let timeout = self.broadcast_timeout;

            in_flight.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, transport.broadcast(&peer, &entry, &operation)).await {
                    Ok(Ok(())) => debug!("Broadcast {} to {}", entry.key, peer.peer_id),
                    Ok(Err(e)) => debug!("Broadcast to {} failed: {}", peer.peer_id, e),
                    Err(_) => debug!("Broadcast to {} timed out", peer.peer_id),
                }
            }));
        }
    }

    /// Wait, at most the broadcast timeout, for pushes still in flight.
    ///
    /// `get` never waits on its broadcasts; a process about to exit calls
    /// this so they are not cut off. Returns how many were pending.
    pub async fn drain_broadcasts(&self) -> usize {
        let pending = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(|p| p.into_inner()));
        let count = pending.len();
        if count > 0 && tokio::time::timeout(self.broadcast_timeout, join_all(pending)).await.is_err() {
            debug!("Stopped waiting on {} broadcast(s)", count);
        }
        count
    }

    /// Remove from memory and disk. Peers are not told; their copies age out by TTL.
    pub fn invalidate(&self, key: &str) -> bool {
        self.local.remove(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DiskCache, MemoryCache};
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Origin that counts calls and returns a fixed body per operation
    #[derive(Default)]
    struct CountingOrigin {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl Origin for CountingOrigin {
        async fn fetch(&self, operation: &str, _params: &Params) -> Result<Vec<u8>, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OriginError::ServerError("boom".to_string()));
            }
            Ok(format!(r#"{{"operation":"{}"}}"#, operation).into_bytes())
        }
    }

    /// Transport with canned answers per peer id, recording broadcasts
    #[derive(Default)]
    struct FakeTransport {
        answers: Mutex<std::collections::HashMap<String, CacheEntry>>,
        broadcasts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn query(&self, peer: &PeerInfo, key: &str) -> Result<Option<CacheEntry>, PeerError> {
            let answers = self.answers.lock().unwrap();
            match answers.get(&peer.peer_id) {
                Some(entry) if entry.key == key => Ok(Some(entry.clone())),
                Some(_) => Ok(None),
                None => Err(PeerError::Timeout(peer.address.clone())),
            }
        }

        async fn broadcast(&self, peer: &PeerInfo, entry: &CacheEntry, _operation: &str) -> Result<(), PeerError> {
            self.broadcasts
                .lock()
                .unwrap()
                .push((peer.peer_id.clone(), entry.key.clone()));
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        origin: Arc<CountingOrigin>,
        local: Arc<LocalCache>,
        dir: TempDir,
    }

    fn fixture(origin: CountingOrigin) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let local = Arc::new(LocalCache::new(
            Some(MemoryCache::new(100)),
            Some(DiskCache::open_at(dir.path()).unwrap()),
            clock.clone(),
        ));
        Fixture {
            clock,
            origin: Arc::new(origin),
            local,
            dir,
        }
    }

    fn cache(f: &Fixture) -> ApiCache {
        ApiCache::new(f.local.clone(), f.origin.clone(), TtlPolicy::default())
    }

    fn params() -> Params {
        Params::from([
            ("owner".to_string(), "org".to_string()),
            ("repo".to_string(), "app".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_second_get_is_memory_hit() {
        let f = fixture(CountingOrigin::default());
        let cache = cache(&f);

        let first = cache.fetch("get_repo", &params()).await.unwrap();
        let second = cache.fetch("get_repo", &params()).await.unwrap();

        assert_eq!(first.origin, EntryOrigin::Origin);
        assert_eq!(second.origin, EntryOrigin::Memory);
        assert_eq!(first.value, second.value);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                requests: 2,
                memory_hits: 1,
                peer_hits: 0,
                disk_hits: 0,
                origin_calls: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let f = fixture(CountingOrigin::default());
        let cache = cache(&f);
        // get_combined_status has a 60s TTL by default
        let ttl = cache.ttl_policy().ttl_for("get_combined_status");

        cache.fetch("get_combined_status", &params()).await.unwrap();

        f.clock.advance(ttl - Duration::from_secs(1));
        let hit = cache.fetch("get_combined_status", &params()).await.unwrap();
        assert_eq!(hit.origin, EntryOrigin::Memory);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);

        f.clock.advance(Duration::from_secs(2));
        let refetched = cache.fetch("get_combined_status", &params()).await.unwrap();
        assert_eq!(refetched.origin, EntryOrigin::Origin);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disk_hit_after_memory_loss() {
        let f = fixture(CountingOrigin::default());
        cache(&f).fetch("list_repos", &params()).await.unwrap();

        // A new process: empty memory, same disk directory
        let restarted = Arc::new(LocalCache::new(
            Some(MemoryCache::new(100)),
            Some(DiskCache::open_at(f.dir.path()).unwrap()),
            f.clock.clone(),
        ));
        let cache = ApiCache::new(restarted, f.origin.clone(), TtlPolicy::default());

        let entry = cache.fetch("list_repos", &params()).await.unwrap();
        assert_eq!(entry.origin, EntryOrigin::Disk);
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);

        let again = cache.fetch("list_repos", &params()).await.unwrap();
        assert_eq!(again.origin, EntryOrigin::Memory);
    }

    #[tokio::test]
    async fn test_origin_errors_propagate_without_retry() {
        let f = fixture(CountingOrigin {
            fail: true,
            ..Default::default()
        });
        let cache = cache(&f);

        let result = cache.fetch("get_repo", &params()).await;

        assert!(matches!(result, Err(OriginError::ServerError(_))));
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);
        assert!(f.local.lookup(&cache_key("get_repo", &[("owner", "org"), ("repo", "app")])).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_origin_fetch() {
        let f = fixture(CountingOrigin::default());
        let cache = cache(&f);
        let first = cache.fetch("get_repo", &params()).await.unwrap();

        assert!(cache.invalidate(&first.key));
        assert!(!cache.invalidate(&first.key));

        let again = cache.fetch("get_repo", &params()).await.unwrap();
        assert_eq!(again.origin, EntryOrigin::Origin);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poisoned_peer_is_ignored_and_honest_peer_wins() {
        let f = fixture(CountingOrigin::default());
        let registry = Arc::new(PeerRegistry::new(
            "me",
            Duration::from_secs(900),
            None,
            f.clock.clone(),
        ));
        registry.observe("liar", "127.0.0.1:1");
        registry.observe("honest", "127.0.0.1:2");

        let key = "some-key";
        let now = f.clock.now();
        let good = CacheEntry::new(key, b"true data".to_vec(), Duration::from_secs(300), now, EntryOrigin::Origin);
        let mut poisoned = good.clone();
        poisoned.value = b"malicious".to_vec();

        let transport = Arc::new(FakeTransport::default());
        {
            let mut answers = transport.answers.lock().unwrap();
            answers.insert("liar".to_string(), poisoned);
            answers.insert("honest".to_string(), good);
        }

        let cache = cache(&f).with_peers(registry, transport);
        let entry = cache.get(key, "get_repo", &params()).await.unwrap();

        assert_eq!(entry.origin, EntryOrigin::Peer);
        assert_eq!(entry.value, b"true data");
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().peer_hits, 1);
    }

    #[tokio::test]
    async fn test_only_poisoned_peers_falls_through_to_origin() {
        let f = fixture(CountingOrigin::default());
        let registry = Arc::new(PeerRegistry::new(
            "me",
            Duration::from_secs(900),
            None,
            f.clock.clone(),
        ));
        registry.observe("liar", "127.0.0.1:1");

        let key = "some-key";
        let mut poisoned = CacheEntry::new(
            key,
            b"true data".to_vec(),
            Duration::from_secs(300),
            f.clock.now(),
            EntryOrigin::Origin,
        );
        poisoned.value = b"malicious".to_vec();

        let transport = Arc::new(FakeTransport::default());
        transport.answers.lock().unwrap().insert("liar".to_string(), poisoned);

        let cache = cache(&f).with_peers(registry, transport);
        let entry = cache.get(key, "get_repo", &params()).await.unwrap();

        assert_eq!(entry.origin, EntryOrigin::Origin);
        assert_ne!(entry.value, b"malicious");
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);
    }

    fn single_peer(f: &Fixture, answer: CacheEntry) -> ApiCache {
        let registry = Arc::new(PeerRegistry::new(
            "me",
            Duration::from_secs(900),
            None,
            f.clock.clone(),
        ));
        registry.observe("peer", "127.0.0.1:1");
        let transport = Arc::new(FakeTransport::default());
        transport.answers.lock().unwrap().insert("peer".to_string(), answer);
        cache(f).with_peers(registry, transport)
    }

    #[tokio::test]
    async fn test_peer_entry_with_unrepresentable_expiry_is_a_miss() {
        let f = fixture(CountingOrigin::default());
        let mut entry = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(60), f.clock.now(), EntryOrigin::Origin);
        entry.created_at = chrono::DateTime::<chrono::Utc>::MAX_UTC;
        let cache = single_peer(&f, entry);

        let got = cache.get("k", "get_repo", &params()).await.unwrap();

        assert_eq!(got.origin, EntryOrigin::Origin);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_future_dated_peer_entry_is_a_miss() {
        let f = fixture(CountingOrigin::default());
        let mut entry = CacheEntry::new("k", b"stale-forever".to_vec(), Duration::from_secs(60), f.clock.now(), EntryOrigin::Origin);
        entry.created_at = f.clock.now() + chrono::Duration::days(3650);
        let cache = single_peer(&f, entry);

        let got = cache.get("k", "get_repo", &params()).await.unwrap();
        assert_eq!(got.origin, EntryOrigin::Origin);
        assert_ne!(got.value, b"stale-forever");

        // What was cached is the origin answer, on the local TTL
        f.clock.advance(Duration::from_secs(30 * 24 * 3600));
        let later = cache.get("k", "get_repo", &params()).await.unwrap();
        assert_eq!(later.origin, EntryOrigin::Origin);
        assert_eq!(f.origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_ttl_is_capped_to_local_policy() {
        let f = fixture(CountingOrigin::default());
        let entry = CacheEntry::new(
            "k",
            b"from peer".to_vec(),
            Duration::from_secs(u64::from(u32::MAX)),
            f.clock.now(),
            EntryOrigin::Origin,
        );
        let cache = single_peer(&f, entry);
        let ttl = cache.ttl_policy().ttl_for("get_repo");

        let got = cache.get("k", "get_repo", &params()).await.unwrap();
        assert_eq!(got.origin, EntryOrigin::Peer);
        assert_eq!(u64::from(got.ttl_seconds), ttl.as_secs());

        f.clock.advance(ttl);
        let cached = cache.get("k", "get_repo", &params()).await.unwrap();
        assert_eq!(cached.origin, EntryOrigin::Memory);
    }

    #[tokio::test]
    async fn test_drain_waits_for_broadcasts() {
        let f = fixture(CountingOrigin::default());
        let registry = Arc::new(PeerRegistry::new(
            "me",
            Duration::from_secs(900),
            None,
            f.clock.clone(),
        ));
        registry.observe("a", "127.0.0.1:1");
        registry.observe("b", "127.0.0.1:2");

        let transport = Arc::new(FakeTransport::default());
        let cache = cache(&f).with_peers(registry, transport.clone());

        cache.fetch("get_repo", &params()).await.unwrap();
        assert_eq!(cache.drain_broadcasts().await, 2);
        assert_eq!(transport.broadcasts.lock().unwrap().len(), 2);

        // Nothing left to wait on
        assert_eq!(cache.drain_broadcasts().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peers_are_silent_misses_and_origin_fetch_broadcasts() {
        let f = fixture(CountingOrigin::default());
        let registry = Arc::new(PeerRegistry::new(
            "me",
            Duration::from_secs(900),
            None,
            f.clock.clone(),
        ));
        // No canned answer -> the fake transport times out
        registry.observe("down", "127.0.0.1:1");

        let transport = Arc::new(FakeTransport::default());
        let cache = cache(&f).with_peers(registry, transport.clone());

        let entry = cache.fetch("get_repo", &params()).await.unwrap();
        assert_eq!(entry.origin, EntryOrigin::Origin);

        // Broadcast runs on a spawned task
        for _ in 0..50 {
            if !transport.broadcasts.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            transport.broadcasts.lock().unwrap().as_slice(),
            &[("down".to_string(), entry.key.clone())]
        );
    }
}
