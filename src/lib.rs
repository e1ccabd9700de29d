//! fleetcache - peer-to-peer encrypted cache for CI runners
//!
//! Runners share GitHub API responses over an encrypted peer protocol,
//! skip code scans whose relevant inputs have not changed, and hand out
//! scoped, expiring secrets with an audit trail.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod content;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod files;
pub mod origin;
pub mod p2p;
pub mod scan;
