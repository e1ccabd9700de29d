//! AES-256-GCM encryption with two independent key paths.
//!
//! * Shared key: PBKDF2-HMAC-SHA256 over a token every legitimate runner already
//!   holds, salted with the protocol identifier. Any runner with the token
//!   derives the same key, so peers need no key exchange.
//! * Master key: 256 random bits generated once per installation and kept by
//!   [`MasterKeyStore`]. Only the credential store uses it.

pub mod master_key;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub use master_key::{KeyVault, MasterKeyStore, OsKeyring};

/// Lower bound on PBKDF2 rounds accepted for key derivation
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

type Result<T> = std::result::Result<T, CryptoError>;

/// 256-bit symmetric key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {} bytes", KEY_LEN)))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// Ciphertext plus the nonce it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Stateless AEAD helper
pub struct CryptoBox;

impl CryptoBox {
    /// Derive the peer-network key from a shared secret.
    ///
    /// `salt` is the protocol identifier; it is public and fixed so every holder
    /// of `shared_secret` reproduces the same key.
    pub fn derive_shared_key(shared_secret: &str, salt: &str, iterations: u32) -> Result<Key> {
        if iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CryptoError::WeakIterations(iterations, MIN_PBKDF2_ITERATIONS));
        }
        if shared_secret.is_empty() {
            return Err(CryptoError::InvalidKey("empty shared secret".to_string()));
        }

        let mut out = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(shared_secret.as_bytes(), salt.as_bytes(), iterations, &mut out);
        let key = Key(out);
        out.zeroize();
        Ok(key)
    }

    /// Fresh random 256-bit key from the OS RNG
    pub fn generate_master_key() -> Key {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = Key(bytes);
        bytes.zeroize();
        key
    }

    /// Encrypt with a fresh random 96-bit nonce
    pub fn encrypt(key: &Key, plaintext: &[u8]) -> Result<Sealed> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        Ok(Sealed { ciphertext, nonce })
    }

    /// Decrypt; any authentication failure is `CryptoError::Decrypt`
    pub fn decrypt(key: &Key, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &str = "/fleetcache/1.0.0";

    #[test]
    fn test_shared_key_round_trip() {
        let key = CryptoBox::derive_shared_key("ghs_token", SALT, MIN_PBKDF2_ITERATIONS).unwrap();

        for plaintext in [&b""[..], b"x", b"{\"items\":[1,2,3]}"] {
            let sealed = CryptoBox::encrypt(&key, plaintext).unwrap();
            let opened = CryptoBox::decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_master_key_round_trip() {
        let key = CryptoBox::generate_master_key();

        for plaintext in [&b""[..], b"secret123"] {
            let sealed = CryptoBox::encrypt(&key, plaintext).unwrap();
            let opened = CryptoBox::decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_shared_key_is_reproducible() {
        let a = CryptoBox::derive_shared_key("ghs_token", SALT, MIN_PBKDF2_ITERATIONS).unwrap();
        let b = CryptoBox::derive_shared_key("ghs_token", SALT, MIN_PBKDF2_ITERATIONS).unwrap();
        let c = CryptoBox::derive_shared_key("other", SALT, MIN_PBKDF2_ITERATIONS).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_weak_iterations_rejected() {
        let err = CryptoBox::derive_shared_key("t", SALT, 1_000).unwrap_err();
        assert!(matches!(err, CryptoError::WeakIterations(1_000, _)));
    }

    #[test]
    fn test_nonce_unique_per_call() {
        let key = CryptoBox::generate_master_key();
        let a = CryptoBox::encrypt(&key, b"same").unwrap();
        let b = CryptoBox::encrypt(&key, b"same").unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = CryptoBox::generate_master_key();
        let mut sealed = CryptoBox::encrypt(&key, b"payload").unwrap();
        sealed.ciphertext[0] ^= 0xff;

        let err = CryptoBox::decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = CryptoBox::generate_master_key();
        let other = CryptoBox::generate_master_key();
        let sealed = CryptoBox::encrypt(&key, b"payload").unwrap();

        assert!(CryptoBox::decrypt(&other, &sealed.ciphertext, &sealed.nonce).is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = CryptoBox::generate_master_key();
        assert_eq!(format!("{:?}", key), "Key(<redacted>)");
    }
}
