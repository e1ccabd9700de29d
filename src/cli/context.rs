//! Command execution context
//!
//! Loads configuration once and builds the components a command needs
//! (local cache, origin, peer network, credential store, scan cache) from it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache::{ApiCache, DiskCache, LocalCache, MemoryCache};
use crate::cli::{GlobalOptions, OutputFormat};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::{AuditLog, CredentialStore};
use crate::crypto::{CryptoBox, Key, MasterKeyStore, OsKeyring};
use crate::error::Result;
use crate::origin::GitHubOrigin;
use crate::p2p::{
    DirectoryRendezvous, HttpRendezvous, PROTOCOL_ID, PeerRegistry, Rendezvous, TcpTransport,
    generate_peer_id,
};
use crate::scan::{GitDiff, ScanCache, ScanStore};

const MASTER_KEY_FILE: &str = "master.key";
const AUDIT_LOG_FILE: &str = "audit.log";

/// The peer-network pieces shared by `get` and `serve`
pub struct PeerStack {
    pub registry: Arc<PeerRegistry>,
    pub shared_key: Arc<Key>,
}

pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
    pub no_cache: bool,
    pub clock: Arc<dyn Clock>,
}

impl CommandContext {
    pub fn new(opts: &GlobalOptions) -> Result<Self> {
        let config = Config::load(opts.config_ref())?;
        Ok(Self {
            config,
            format: opts.format,
            no_cache: opts.no_cache,
            clock: Arc::new(SystemClock),
        })
    }

    /// Memory and disk layers as configured (both off under --no-cache)
    pub fn local_cache(&self) -> Result<Arc<LocalCache>> {
        let cache = &self.config.cache;
        let memory = (cache.memory_enabled && !self.no_cache)
            .then(|| MemoryCache::new(cache.max_memory_entries));
        let disk = if cache.disk_enabled && !self.no_cache {
            Some(DiskCache::open_at(&self.config.cache_dir()?)?)
        } else {
            None
        };
        Ok(Arc::new(LocalCache::new(memory, disk, self.clock.clone())))
    }

    /// Disk layer only, for the `cache` maintenance commands
    pub fn disk_only_cache(&self) -> Result<LocalCache> {
        let disk = DiskCache::open_at(&self.config.cache_dir()?)?;
        Ok(LocalCache::new(None, Some(disk), self.clock.clone()))
    }

    pub fn github_origin(&self) -> Result<GitHubOrigin> {
        let token = std::env::var(&self.config.github.token_env)
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_none() {
            debug!(
                "${} not set, calling the GitHub API unauthenticated",
                self.config.github.token_env
            );
        }
        Ok(GitHubOrigin::with_base_url(&self.config.github.api_url, token)?)
    }

    fn rendezvous(&self) -> Result<Option<Arc<dyn Rendezvous>>> {
        let p2p = &self.config.p2p;
        let rendezvous: Arc<dyn Rendezvous> = match (&p2p.rendezvous.url, &p2p.rendezvous.dir) {
            (Some(url), _) => Arc::new(HttpRendezvous::new(url, p2p.discovery_timeout())?),
            (None, Some(dir)) => Arc::new(DirectoryRendezvous::new(dir.clone())),
            (None, None) => return Ok(None),
        };
        Ok(Some(rendezvous))
    }

    /// Registry and shared key. Errors if the shared token is missing.
    pub fn peer_stack(&self) -> Result<PeerStack> {
        let p2p = &self.config.p2p;
        let token = p2p.shared_token()?;
        let shared_key = CryptoBox::derive_shared_key(&token, PROTOCOL_ID, self.config.crypto.pbkdf2_iterations)?;

        let registry = PeerRegistry::new(
            generate_peer_id(),
            p2p.peer_ttl(),
            self.rendezvous()?,
            self.clock.clone(),
        )
        .with_discovery_timeout(p2p.discovery_timeout());

        Ok(PeerStack {
            registry: Arc::new(registry),
            shared_key: Arc::new(shared_key),
        })
    }

    /// Full cascade for one-shot `get`. The peer layer is skipped (with a
    /// warning) when it is enabled but not usable.
    pub async fn api_cache(&self) -> Result<ApiCache> {
        let local = self.local_cache()?;
        let origin = Arc::new(self.github_origin()?);
        let cache = ApiCache::new(local, origin, self.config.cache.ttl.clone())
            .with_broadcast_timeout(self.config.p2p.broadcast_timeout());

        if self.no_cache || !self.config.p2p.enabled {
            return Ok(cache);
        }

        let stack = match self.peer_stack() {
            Ok(stack) => stack,
            Err(e) => {
                warn!("Peer layer disabled: {}", e);
                return Ok(cache);
            }
        };
        if let Err(e) = stack.registry.discover().await {
            warn!("Peer discovery failed: {}", e);
        }

        let transport = TcpTransport::new(stack.shared_key.clone(), self.config.p2p.query_timeout());
        Ok(cache.with_peers(stack.registry, Arc::new(transport)))
    }

    pub fn credential_store(&self) -> Result<CredentialStore> {
        let dir = self.config.credentials_dir()?;
        let mut key_store = MasterKeyStore::new(
            dir.join(MASTER_KEY_FILE),
            self.config.credentials.passphrase(),
            self.config.crypto.pbkdf2_iterations,
        );
        if self.config.credentials.keyring {
            key_store = key_store.with_vault(Box::new(OsKeyring::default()));
        }
        let key = key_store.load_or_create()?;

        let audit = if self.config.credentials.audit_log {
            AuditLog::to_file(dir.join(AUDIT_LOG_FILE))
        } else {
            AuditLog::in_memory()
        };

        let store = CredentialStore::open(&dir, key, audit, self.clock.clone())?;
        match store.sweep_expired() {
            Ok(0) => {}
            Ok(n) => debug!("Removed {} expired credential(s)", n),
            Err(e) => warn!("Credential sweep failed: {}", e),
        }
        Ok(store)
    }

    pub fn audit_log_path(&self) -> Result<std::path::PathBuf> {
        Ok(self.config.credentials_dir()?.join(AUDIT_LOG_FILE))
    }

    pub fn scan_cache(&self, repo_dir: &Path) -> Result<ScanCache> {
        let store = ScanStore::open_at(&self.config.scan_dir()?)?;
        Ok(ScanCache::new(
            store,
            Arc::new(GitDiff::new(repo_dir)),
            self.clock.clone(),
            Duration::from_secs(self.config.scan.average_scan_duration_secs),
        ))
    }
}

/// Address other nodes should dial: the advertise host if set, else the bound one
pub fn advertised_address(bound: SocketAddr, advertise_host: Option<&str>) -> String {
    match advertise_host {
        Some(host) => format!("{}:{}", host, bound.port()),
        None => bound.to_string(),
    }
}
