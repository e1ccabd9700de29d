//! Serving side of the peer protocol.
//!
//! Answers `get` from the local layers only (memory, then disk) so a remote
//! request never triggers a cascade of its own. Accepts `put` and `broadcast`
//! after decrypting and verifying the content hash.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::registry::PeerRegistry;
use super::wire::{self, Envelope, MessageType};
use crate::cache::{CacheEntry, EntryOrigin, LocalCache, TtlPolicy};
use crate::crypto::Key;
use crate::error::PeerError;

/// Operation name recorded for pushed entries that didn't name one
const UNKNOWN_OPERATION: &str = "peer";

#[derive(Clone)]
struct Shared {
    local: Arc<LocalCache>,
    registry: Arc<PeerRegistry>,
    shared_key: Arc<Key>,
    io_timeout: Duration,
    ttl: Arc<TtlPolicy>,
}

pub struct PeerServer {
    listener: TcpListener,
    shared: Shared,
}

impl PeerServer {
    /// Bind the first free port in `port_start..=port_end` on `host`.
    /// A range of `0..=0` binds an ephemeral port.
    pub async fn bind(
        host: &str,
        port_start: u16,
        port_end: u16,
        local: Arc<LocalCache>,
        registry: Arc<PeerRegistry>,
        shared_key: Arc<Key>,
    ) -> Result<Self, PeerError> {
        for port in port_start..=port_end {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    if let Ok(addr) = listener.local_addr() {
                        info!("Peer server listening on {}", addr);
                    }
                    return Ok(Self {
                        listener,
                        shared: Shared {
                            local,
                            registry,
                            shared_key,
                            io_timeout: Duration::from_secs(5),
                            ttl: Arc::new(TtlPolicy::default()),
                        },
                    });
                }
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }
        Err(PeerError::NoFreePort {
            start: port_start,
            end: port_end,
        })
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.shared.io_timeout = timeout;
        self
    }

    /// TTL table pushed entries are capped to
    pub fn with_ttl_policy(mut self, ttl: TtlPolicy) -> Self {
        self.shared.ttl = Arc::new(ttl);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PeerError> {
        self.listener.local_addr().map_err(|e| PeerError::Connection {
            addr: "local listener".to_string(),
            reason: e.to_string(),
        })
    }

    /// Accept connections until the returned task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        let Self { listener, shared } = self;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &shared).await {
                                debug!("Connection from {} ended: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

async fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<(), PeerError> {
    let request = tokio::time::timeout(shared.io_timeout, wire::read_frame(&mut stream))
        .await
        .map_err(|_| PeerError::Timeout("incoming request".to_string()))??;

    let reply = respond(&request, shared);
    if let Some(reply) = reply {
        tokio::time::timeout(shared.io_timeout, wire::write_frame(&mut stream, &reply))
            .await
            .map_err(|_| PeerError::Timeout("reply".to_string()))??;
    }
    Ok(())
}

/// Build the reply for one request; `None` for messages that get no reply
fn respond(request: &Envelope, shared: &Shared) -> Option<Envelope> {
    if let Err(e) = request.check_protocol() {
        warn!("{}", e);
        return match request.message_type {
            MessageType::Broadcast => None,
            _ => Some(Envelope::rejected(&request.key, e.to_string())),
        };
    }

    if let Some(ref sender) = request.sender {
        shared.registry.observe(&sender.peer_id, &sender.address);
    }

    match request.message_type {
        MessageType::Get => Some(answer_get(&request.key, shared)),
        MessageType::Put => Some(match accept_push(request, shared) {
            Ok(()) => Envelope::ack(&request.key),
            Err(e) => Envelope::rejected(&request.key, e.to_string()),
        }),
        MessageType::Broadcast => {
            if let Err(e) = accept_push(request, shared) {
                debug!("Dropped broadcast for {}: {}", request.key, e);
            }
            None
        }
        other => Some(Envelope::rejected(
            &request.key,
            format!("{:?} is not a request", other),
        )),
    }
}

fn answer_get(key: &str, shared: &Shared) -> Envelope {
    let Some(entry) = shared.local.lookup(key) else {
        return Envelope::not_found(key);
    };

    match Envelope::carrying(MessageType::Found, &entry, None, None, &shared.shared_key) {
        Ok(found) => {
            debug!("Served {} to a peer", key);
            found
        }
        Err(e) => {
            warn!("Could not seal {} for a peer: {}", key, e);
            Envelope::not_found(key)
        }
    }
}

fn accept_push(request: &Envelope, shared: &Shared) -> Result<(), PeerError> {
    let entry: CacheEntry = request.open(&shared.shared_key).inspect_err(|e| {
        if matches!(e, PeerError::Decrypt) {
            warn!("Undecryptable push for {}", request.key);
        }
    })?;

    if !entry.verify() {
        warn!("Rejected push for {}: content hash mismatch", request.key);
        return Err(PeerError::Verification(request.key.clone()));
    }

    let now = shared.local.now();
    let cap = match request.operation.as_deref() {
        Some(operation) => shared.ttl.ttl_for(operation),
        None => shared.ttl.max_ttl(),
    };
    let Some(entry) = entry.admit_from_peer(now, cap) else {
        warn!("Rejected push for {}: created in the future", request.key);
        return Err(PeerError::Rejected(format!("{} is future-dated", request.key)));
    };
    if entry.is_expired(now) {
        return Err(PeerError::Rejected(format!("{} already expired", request.key)));
    }

    let operation = request.operation.as_deref().unwrap_or(UNKNOWN_OPERATION);
    shared.local.store(&entry.with_origin(EntryOrigin::Peer), operation);
    debug!("Stored pushed entry {}", request.key);
    Ok(())
}
