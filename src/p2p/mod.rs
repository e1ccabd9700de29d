//! Peer network: registry, rendezvous, wire format, client transport and server.

pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod transport;
pub mod wire;

pub use registry::{PeerInfo, PeerRegistry};
pub use rendezvous::{Advert, DirectoryRendezvous, HttpRendezvous, Rendezvous};
pub use server::PeerServer;
pub use transport::{PeerTransport, TcpTransport};

/// Protocol identifier carried in every envelope; also the PBKDF2 salt for the shared key
pub const PROTOCOL_ID: &str = "/fleetcache/1.0.0";

/// Random identifier for this node, regenerated per process
pub fn generate_peer_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_ids_are_distinct() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
