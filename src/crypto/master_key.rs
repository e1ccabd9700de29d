//! Persistence for the credential master key.
//!
//! The OS keyring is tried first. When it is not configured or not reachable
//! (headless runners often have no Secret Service) the key falls back to a
//! single owner-only file. With a passphrase the file holds the key sealed
//! under a PBKDF2 key derived from the passphrase and a random per-file salt;
//! without one it holds the hex-encoded key and a warning is logged.

use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{CryptoBox, Key, MIN_PBKDF2_ITERATIONS};
use crate::error::CryptoError;
use crate::files::write_owner_only;

type Result<T> = std::result::Result<T, CryptoError>;

const SALT_LEN: usize = 16;

/// Keyring service name the master key is filed under
pub const KEYRING_SERVICE: &str = "fleetcache";

/// Keyring account holding the hex-encoded master key
pub const KEYRING_USER: &str = "master-key";

/// A secure place to keep the hex-encoded master key
pub trait KeyVault: Send + Sync {
    /// The stored key, `None` if nothing is stored yet
    fn load(&self) -> Result<Option<Zeroizing<String>>>;

    fn save(&self, hex_key: &str) -> Result<()>;
}

/// The platform keyring through the `keyring` crate
pub struct OsKeyring {
    service: String,
    user: String,
}

impl OsKeyring {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| CryptoError::KeyStore(format!("keyring: {}", e)))
    }
}

impl Default for OsKeyring {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_USER)
    }
}

impl KeyVault for OsKeyring {
    fn load(&self) -> Result<Option<Zeroizing<String>>> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CryptoError::KeyStore(format!("keyring: {}", e))),
        }
    }

    fn save(&self, hex_key: &str) -> Result<()> {
        self.entry()?
            .set_password(hex_key)
            .map_err(|e| CryptoError::KeyStore(format!("keyring: {}", e)))
    }
}

/// On-disk format of the key file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum KeyFile {
    Plain {
        key: String,
    },
    Sealed {
        salt: String,
        nonce: String,
        ciphertext: String,
        iterations: u32,
    },
}

/// Loads or creates the master key: keyring first, key file as fallback
pub struct MasterKeyStore {
    path: PathBuf,
    passphrase: Option<String>,
    iterations: u32,
    vault: Option<Box<dyn KeyVault>>,
}

impl MasterKeyStore {
    /// File-only store at `path`
    pub fn new(path: impl Into<PathBuf>, passphrase: Option<String>, iterations: u32) -> Self {
        Self {
            path: path.into(),
            passphrase,
            iterations: iterations.max(MIN_PBKDF2_ITERATIONS),
            vault: None,
        }
    }

    /// Prefer `vault` over the key file
    pub fn with_vault(mut self, vault: Box<dyn KeyVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the existing key, or generate and persist one on first use.
    ///
    /// A key file left by an earlier fallback keeps being used even once the
    /// keyring becomes reachable, so secrets sealed under it stay readable.
    pub fn load_or_create(&self) -> Result<Key> {
        let mut vault = self.vault.as_deref();

        if let Some(v) = vault {
            match v.load() {
                Ok(Some(hex_key)) => return key_from_hex(&hex_key),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("{}; using the key file at {}", e, self.path.display());
                    vault = None;
                }
            }
        }

        if self.path.exists() {
            return self.load();
        }

        let key = CryptoBox::generate_master_key();
        if let Some(v) = vault {
            let hex_key = Zeroizing::new(hex::encode(key.as_bytes()));
            match v.save(&hex_key) {
                Ok(()) => {
                    log::info!("Generated new master key in the OS keyring");
                    return Ok(key);
                }
                Err(e) => log::warn!("{}; using the key file at {}", e, self.path.display()),
            }
        }

        self.store(&key)?;
        log::info!("Generated new master key at {}", self.path.display());
        Ok(key)
    }

    fn load(&self) -> Result<Key> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| CryptoError::KeyStore(format!("Failed to read key file: {}", e)))?;
        let file: KeyFile = serde_json::from_str(&contents)
            .map_err(|e| CryptoError::KeyStore(format!("Malformed key file: {}", e)))?;

        match file {
            KeyFile::Plain { key } => key_from_hex(&Zeroizing::new(key)),
            KeyFile::Sealed {
                salt,
                nonce,
                ciphertext,
                iterations,
            } => {
                let passphrase = self.passphrase.as_deref().ok_or_else(|| {
                    CryptoError::KeyStore("Key file is sealed but no passphrase is set".to_string())
                })?;
                let salt = decode_b64(&salt)?;
                let nonce = decode_b64(&nonce)?;
                let ciphertext = decode_b64(&ciphertext)?;
                let wrapping = wrapping_key(passphrase, &salt, iterations)?;
                let bytes = Zeroizing::new(CryptoBox::decrypt(&wrapping, &ciphertext, &nonce)?);
                Key::from_slice(&bytes)
            }
        }
    }

    fn store(&self, key: &Key) -> Result<()> {
        let file = match self.passphrase.as_deref() {
            None => {
                log::warn!(
                    "No keyring and no passphrase: master key stored unsealed at {} (owner-only)",
                    self.path.display()
                );
                KeyFile::Plain {
                    key: hex::encode(key.as_bytes()),
                }
            }
            Some(passphrase) => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let wrapping = wrapping_key(passphrase, &salt, self.iterations)?;
                let sealed = CryptoBox::encrypt(&wrapping, key.as_bytes())?;
                KeyFile::Sealed {
                    salt: B64.encode(salt),
                    nonce: B64.encode(sealed.nonce),
                    ciphertext: B64.encode(sealed.ciphertext),
                    iterations: self.iterations,
                }
            }
        };

        let contents = Zeroizing::new(
            serde_json::to_string_pretty(&file).map_err(|e| CryptoError::KeyStore(e.to_string()))?,
        );
        write_owner_only(&self.path, contents.as_bytes())
            .map_err(|e| CryptoError::KeyStore(format!("Failed to write key file: {}", e)))
    }
}

fn key_from_hex(hex_key: &str) -> Result<Key> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(format!("bad hex: {}", e)))?,
    );
    Key::from_slice(&bytes)
}

fn wrapping_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<Key> {
    // The passphrase salt is binary; hex keeps derive_shared_key's str salt contract.
    CryptoBox::derive_shared_key(passphrase, &hex::encode(salt), iterations)
}

fn decode_b64(s: &str) -> Result<Vec<u8>> {
    B64.decode(s)
        .map_err(|e| CryptoError::KeyStore(format!("bad base64: {}", e)))
}
