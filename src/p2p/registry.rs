//! Known peers with TTL expiry.
//!
//! Peers are trusted for availability only: anything they send is verified by
//! content hash before use. An entry lives for `peer_ttl` after it was last
//! seen, and is refreshed by discovery or by any successful exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::rendezvous::{Advert, Rendezvous};
use super::PROTOCOL_ID;
use crate::clock::Clock;
use crate::error::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct PeerRegistry {
    self_id: String,
    self_address: Mutex<Option<String>>,
    peers: Mutex<HashMap<String, PeerInfo>>,
    peer_ttl: chrono::Duration,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    discovery_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl PeerRegistry {
    pub fn new(
        self_id: impl Into<String>,
        peer_ttl: Duration,
        rendezvous: Option<Arc<dyn Rendezvous>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            self_address: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            peer_ttl: chrono::Duration::from_std(peer_ttl).unwrap_or(chrono::Duration::minutes(15)),
            rendezvous,
            discovery_timeout: Duration::from_secs(2),
            clock,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_address(&self) -> Option<String> {
        self.self_address
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerInfo>> {
        self.peers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record contact with a peer at `seen_at`. Unknown peers are added; known
    /// peers are refreshed (never moved backwards in time).
    fn merge(&self, peer_id: &str, address: &str, seen_at: DateTime<Utc>) {
        if peer_id == self.self_id {
            return;
        }
        let seen_at = seen_at.min(self.clock.now());
        let mut peers = self.peers();

        match peers.get_mut(peer_id) {
            Some(info) => {
                info.address = address.to_string();
                if seen_at > info.last_seen {
                    info.last_seen = seen_at;
                    info.expires_at = seen_at + self.peer_ttl;
                }
            }
            None => {
                debug!("New peer {} at {}", peer_id, address);
                peers.insert(
                    peer_id.to_string(),
                    PeerInfo {
                        peer_id: peer_id.to_string(),
                        address: address.to_string(),
                        last_seen: seen_at,
                        expires_at: seen_at + self.peer_ttl,
                    },
                );
            }
        }
    }

    /// A peer contacted us, or answered us
    pub fn observe(&self, peer_id: &str, address: &str) {
        self.merge(peer_id, address, self.clock.now());
    }

    /// Refresh a known peer after a successful exchange
    pub fn touch(&self, peer_id: &str) {
        let now = self.clock.now();
        if let Some(info) = self.peers().get_mut(peer_id) {
            info.last_seen = now;
            info.expires_at = now + self.peer_ttl;
        }
    }

    /// Pull adverts for our protocol from the rendezvous and merge them.
    /// Returns the number of adverts merged.
    pub async fn discover(&self) -> Result<usize, PeerError> {
        let Some(ref rendezvous) = self.rendezvous else {
            return Ok(0);
        };

        let adverts = tokio::time::timeout(self.discovery_timeout, rendezvous.list_advertised())
            .await
            .map_err(|_| PeerError::Timeout("rendezvous".to_string()))??;

        let mut merged = 0;
        for advert in adverts
            .iter()
            .filter(|a| a.protocol == PROTOCOL_ID && a.peer_id != self.self_id)
        {
            self.merge(&advert.peer_id, &advert.address, advert.advertised_at);
            merged += 1;
        }
        debug!("Discovery merged {} peer(s)", merged);
        Ok(merged)
    }

    /// Advertise this node at `address`
    pub async fn register_self(&self, address: &str) -> Result<(), PeerError> {
        *self
            .self_address
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(address.to_string());

        let Some(ref rendezvous) = self.rendezvous else {
            return Ok(());
        };

        let advert = Advert::new(&self.self_id, address, self.clock.now());
        tokio::time::timeout(self.discovery_timeout, rendezvous.advertise(&advert))
            .await
            .map_err(|_| PeerError::Timeout("rendezvous".to_string()))??;

        info!("Registered {} at {}", self.self_id, address);
        Ok(())
    }

    /// Drop peers with `expires_at < now`; returns how many were dropped
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut peers = self.peers();
        let before = peers.len();
        peers.retain(|_, info| info.expires_at >= now);
        let removed = before - peers.len();
        if removed > 0 {
            debug!("Pruned {} expired peer(s)", removed);
        }
        removed
    }

    /// Unexpired peers, most recently seen first
    pub fn list_live_peers(&self) -> Vec<PeerInfo> {
        let now = self.clock.now();
        let mut live: Vec<PeerInfo> = self
            .peers()
            .values()
            .filter(|info| info.expires_at >= now)
            .cloned()
            .collect();
        live.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        live
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-advertise, discover and prune every `interval` until the task is aborted
    pub fn spawn_maintenance(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                if let Some(address) = self.self_address()
                    && let Err(e) = self.register_self(&address).await
                {
                    warn!("Re-advertising failed: {}", e);
                }
                if let Err(e) = self.discover().await {
                    warn!("Peer discovery failed: {}", e);
                }
                self.prune();
            }
        })
    }
}
