//! Error types for fleetcache

use std::time::Duration;
use thiserror::Error;

/// Result type alias for fleetcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the application
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation failed: {0}")]
    Other(String),
}

/// Failures of the origin collaborator (the GitHub API or whatever fetches on a full miss).
///
/// These are always propagated to the caller; nothing in the cache retries them.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("Authentication failed. Check the token named by `github.token_env`.")]
    Unauthorized,

    #[error("Access denied by origin: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded. Retry after {0:?}")]
    RateLimit(Duration),

    #[error("Origin server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid origin response: {0}")]
    InvalidResponse(String),

    #[error("Unknown operation '{0}' (no path template and no `endpoint` param)")]
    UnknownOperation(String),

    #[error("Missing parameter '{param}' for operation '{operation}'")]
    MissingParam { operation: String, param: String },
}

impl From<reqwest::Error> for OriginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OriginError::Network("Request timed out".to_string())
        } else if err.is_connect() {
            OriginError::Network("Failed to connect to origin".to_string())
        } else {
            OriginError::Network(err.to_string())
        }
    }
}

/// Local cache storage errors (memory/disk layers)
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Could not determine cache directory")]
    NoHome,

    #[error("Cache IO error: {0}")]
    Io(String),

    #[error("Cache database error: {0}")]
    Database(String),

    #[error("Corrupt cache record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Database(err.to_string())
    }
}

/// Peer network errors.
///
/// Inside the cascade these are recovered by moving to the next layer and are
/// never surfaced to `ApiCache::get` callers.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {0} timed out")]
    Timeout(String),

    #[error("Connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },

    #[error("Protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Content hash mismatch for key {0}")]
    Verification(String),

    #[error("Payload could not be decrypted")]
    Decrypt,

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },
}

impl From<reqwest::Error> for PeerError {
    fn from(err: reqwest::Error) -> Self {
        PeerError::Rendezvous(err.to_string())
    }
}

/// Encryption and key management errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: tampered, corrupted, or encrypted under another key
    #[error("Decryption failed (authentication tag mismatch)")]
    Decrypt,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("PBKDF2 iteration count {0} is below the minimum of {1}")]
    WeakIterations(u32, u32),

    #[error("Key store error: {0}")]
    KeyStore(String),
}

/// Why a credential request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    Expired,
    ScopeMismatch,
    DecryptError,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NotFound => "not found",
            DenyReason::Expired => "expired",
            DenyReason::ScopeMismatch => "scope mismatch",
            DenyReason::DecryptError => "decrypt error",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential store errors. Messages carry credential ids only, never secret material.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Access denied for credential '{id}': {reason}")]
    AccessDenied { id: String, reason: DenyReason },

    #[error("Invalid scope '{0}' (expected global, repo:<m>, workflow:<m> or runner:<m>)")]
    InvalidScope(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("TTL out of range: {0}")]
    InvalidTtl(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl CredentialError {
    /// The deny reason, if this is an access denial
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            CredentialError::AccessDenied { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Scan cache errors
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Diff unavailable between {from} and {to}: {reason}")]
    DiffUnavailable {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Scan store error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        ScanError::Storage(err.to_string())
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),

    #[error("Shared token not set. Export ${0} to enable the peer network.")]
    MissingSharedToken(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
