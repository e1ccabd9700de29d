//! Configuration management for fleetcache
//!
//! Everything here is tuning; secrets are only ever read from the environment
//! variables the config names.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::TtlPolicy;
use crate::error::{ConfigError, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub github: GitHubConfig,
}

/// API cache layers and freshness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub memory_enabled: bool,

    #[serde(default = "default_true")]
    pub disk_enabled: bool,

    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Memory sweep period in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Disk cache directory (defaults to the XDG cache dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub ttl: TtlPolicy,
}

/// Peer network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Address advertised to peers (defaults to `bind_host`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    #[serde(default = "default_port_start")]
    pub port_start: u16,

    #[serde(default = "default_port_end")]
    pub port_end: u16,

    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_broadcast_timeout")]
    pub broadcast_timeout_ms: u64,

    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Environment variable holding the shared token the P2P key derives from
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default)]
    pub rendezvous: RendezvousConfig,
}

/// Where peers find each other. At most one of these should be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Base URL of an HTTP peer directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Shared directory used by runners on the same host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Environment variable holding the master key passphrase, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_env: Option<String>,

    /// Keep the master key in the OS keyring when one is reachable
    #[serde(default = "default_true")]
    pub keyring: bool,

    #[serde(default = "default_true")]
    pub audit_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Used for the time-saved estimate
    #[serde(default = "default_average_scan_secs")]
    pub average_scan_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_true() -> bool {
    true
}

fn default_max_memory_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_start() -> u16 {
    9000
}

fn default_port_end() -> u16 {
    9010
}

fn default_peer_ttl() -> u64 {
    15 * 60
}

fn default_query_timeout() -> u64 {
    1_500
}

fn default_broadcast_timeout() -> u64 {
    1_000
}

fn default_discovery_timeout() -> u64 {
    2_000
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_pbkdf2_iterations() -> u32 {
    crate::crypto::MIN_PBKDF2_ITERATIONS
}

fn default_average_scan_secs() -> u64 {
    10 * 60
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_enabled: true,
            disk_enabled: true,
            max_memory_entries: default_max_memory_entries(),
            sweep_interval_secs: default_sweep_interval(),
            dir: None,
            ttl: TtlPolicy::default(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_host: default_bind_host(),
            advertise_host: None,
            port_start: default_port_start(),
            port_end: default_port_end(),
            peer_ttl_secs: default_peer_ttl(),
            query_timeout_ms: default_query_timeout(),
            broadcast_timeout_ms: default_broadcast_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
            discovery_interval_secs: default_discovery_interval(),
            token_env: default_token_env(),
            rendezvous: RendezvousConfig::default(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            passphrase_env: None,
            keyring: true,
            audit_log: true,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            dir: None,
            average_scan_duration_secs: default_average_scan_secs(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
        }
    }
}

impl P2pConfig {
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Read the shared token from the configured environment variable
    pub fn shared_token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::MissingSharedToken(self.token_env.clone()).into())
    }
}

impl CredentialsConfig {
    pub fn passphrase(&self) -> Option<String> {
        self.passphrase_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|p| !p.is_empty())
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::Invalid(
            "Could not determine home directory".to_string(),
        ))?;

        Ok(home.join(".fleetcache").join("config.yaml"))
    }

    /// Load from `path` (or the default path); a missing file yields defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_path()?,
        };
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&contents).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        let contents =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;

        // 600 on Unix from the moment the file exists
        crate::files::write_owner_only(&path, contents.as_bytes())?;

        Ok(())
    }

    /// Reject settings that would break invariants
    pub fn validate(&self) -> Result<()> {
        if self.p2p.port_start > self.p2p.port_end {
            return Err(ConfigError::Invalid(format!(
                "p2p.port_start ({}) is greater than p2p.port_end ({})",
                self.p2p.port_start, self.p2p.port_end
            ))
            .into());
        }
        if self.crypto.pbkdf2_iterations < crate::crypto::MIN_PBKDF2_ITERATIONS {
            return Err(ConfigError::Invalid(format!(
                "crypto.pbkdf2_iterations must be at least {}",
                crate::crypto::MIN_PBKDF2_ITERATIONS
            ))
            .into());
        }
        if self.p2p.rendezvous.url.is_some() && self.p2p.rendezvous.dir.is_some() {
            return Err(ConfigError::Invalid(
                "set only one of p2p.rendezvous.url and p2p.rendezvous.dir".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Disk cache directory (~/.cache/fleetcache on Linux)
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::cache::DiskCache::default_dir()?),
        }
    }

    pub fn credentials_dir(&self) -> Result<PathBuf> {
        match &self.credentials.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("credentials")),
        }
    }

    pub fn scan_dir(&self) -> Result<PathBuf> {
        match &self.scan.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("scans")),
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or(ConfigError::Invalid(
        "Could not determine data directory".to_string(),
    ))?;
    Ok(base.join("fleetcache"))
}
