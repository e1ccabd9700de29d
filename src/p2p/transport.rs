//! Client side of the peer protocol.
//!
//! One short-lived TCP connection per request. Every exchange is bounded by
//! the configured timeout, so a slow or dead peer only costs that much before
//! the cascade moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;

use super::registry::PeerInfo;
use super::wire::{self, Envelope, MessageType, Sender};
use crate::cache::CacheEntry;
use crate::crypto::Key;
use crate::error::PeerError;

/// How `ApiCache` talks to other nodes.
///
/// `query` returns the decrypted entry as received; the caller verifies the
/// content hash before trusting it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask a peer for `key`. `Ok(None)` means the peer answered "not found".
    async fn query(&self, peer: &PeerInfo, key: &str) -> Result<Option<CacheEntry>, PeerError>;

    /// Push an entry without waiting for a reply
    async fn broadcast(&self, peer: &PeerInfo, entry: &CacheEntry, operation: &str) -> Result<(), PeerError>;
}

pub struct TcpTransport {
    shared_key: Arc<Key>,
    timeout: Duration,
    sender: Option<Sender>,
}

impl TcpTransport {
    pub fn new(shared_key: Arc<Key>, timeout: Duration) -> Self {
        Self {
            shared_key,
            timeout,
            sender: None,
        }
    }

    /// Identify ourselves in outgoing envelopes so receivers learn about us
    pub fn with_sender(mut self, peer_id: &str, address: &str) -> Self {
        self.sender = Some(Sender {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
        });
        self
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<TcpStream, PeerError> {
        let stream = TcpStream::connect(&peer.address)
            .await
            .map_err(|e| PeerError::Connection {
                addr: peer.address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn exchange(&self, peer: &PeerInfo, request: &Envelope) -> Result<Envelope, PeerError> {
        let mut stream = self.connect(peer).await?;
        wire::write_frame(&mut stream, request).await?;
        let response = wire::read_frame(&mut stream).await?;
        response.check_protocol()?;
        Ok(response)
    }

    async fn send_only(&self, peer: &PeerInfo, message: &Envelope) -> Result<(), PeerError> {
        let mut stream = self.connect(peer).await?;
        wire::write_frame(&mut stream, message).await
    }

    /// Push an entry and wait for the peer to acknowledge storing it
    pub async fn put(&self, peer: &PeerInfo, entry: &CacheEntry, operation: &str) -> Result<(), PeerError> {
        let request = Envelope::carrying(
            MessageType::Put,
            entry,
            Some(operation),
            self.sender.clone(),
            &self.shared_key,
        )
        .map_err(|e| PeerError::Frame(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.exchange(peer, &request))
            .await
            .map_err(|_| PeerError::Timeout(peer.address.clone()))??;

        match response.message_type {
            MessageType::Ack => Ok(()),
            MessageType::Rejected => Err(PeerError::Rejected(response.reason.unwrap_or_default())),
            other => Err(PeerError::Frame(format!("unexpected {:?} reply to put", other))),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn query(&self, peer: &PeerInfo, key: &str) -> Result<Option<CacheEntry>, PeerError> {
        let request = Envelope::get(key, self.sender.clone());

        let response = tokio::time::timeout(self.timeout, self.exchange(peer, &request))
            .await
            .map_err(|_| PeerError::Timeout(peer.address.clone()))??;

        match response.message_type {
            MessageType::Found => {
                if response.key != key {
                    return Err(PeerError::Frame(format!(
                        "asked for {} but peer answered {}",
                        key, response.key
                    )));
                }
                response.open(&self.shared_key).map(Some)
            }
            MessageType::NotFound => {
                debug!("Peer {} has no {}", peer.peer_id, key);
                Ok(None)
            }
            MessageType::Rejected => Err(PeerError::Rejected(response.reason.unwrap_or_default())),
            other => Err(PeerError::Frame(format!("unexpected {:?} reply to get", other))),
        }
    }

    async fn broadcast(&self, peer: &PeerInfo, entry: &CacheEntry, operation: &str) -> Result<(), PeerError> {
        let message = Envelope::carrying(
            MessageType::Broadcast,
            entry,
            Some(operation),
            self.sender.clone(),
            &self.shared_key,
        )
        .map_err(|e| PeerError::Frame(e.to_string()))?;

        tokio::time::timeout(self.timeout, self.send_only(peer, &message))
            .await
            .map_err(|_| PeerError::Timeout(peer.address.clone()))?
    }
}
