//! Content addressing for cache values.
//!
//! Hashes are multihash-shaped: an algorithm code and digest length precede the
//! digest, so a future algorithm can coexist with stored SHA-256 hashes. The
//! textual form is `sha2-256:<hex digest>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Multihash code for SHA2-256
const SHA2_256_CODE: u8 = 0x12;
const SHA2_256_LEN: usize = 32;
const SHA2_256_NAME: &str = "sha2-256";

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub fn code(&self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => SHA2_256_CODE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => SHA2_256_NAME,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            SHA2_256_NAME => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Self-describing content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: [u8; SHA2_256_LEN],
}

impl ContentHash {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Binary multihash form: `<code><len><digest>`
    pub fn to_multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.digest.len());
        out.push(self.algorithm.code());
        out.push(self.digest.len() as u8);
        out.extend_from_slice(&self.digest);
        out
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), hex::encode(self.digest))
    }
}

/// Error parsing a textual content hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content hash '{0}'")]
pub struct ParseHashError(String);

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, hex_digest) = s.split_once(':').ok_or_else(|| ParseHashError(s.into()))?;
        let algorithm = HashAlgorithm::from_name(name).ok_or_else(|| ParseHashError(s.into()))?;
        let bytes = hex::decode(hex_digest).map_err(|_| ParseHashError(s.into()))?;
        let digest: [u8; SHA2_256_LEN] =
            bytes.try_into().map_err(|_| ParseHashError(s.into()))?;
        Ok(Self { algorithm, digest })
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes and checks content hashes. Stateless.
pub struct ContentAddresser;

impl ContentAddresser {
    pub fn hash(value: &[u8]) -> ContentHash {
        let digest: [u8; SHA2_256_LEN] = Sha256::digest(value).into();
        ContentHash {
            algorithm: HashAlgorithm::Sha256,
            digest,
        }
    }

    /// Hash of a serializable value via its canonical JSON encoding
    pub fn hash_json<T: Serialize>(value: &T) -> serde_json::Result<ContentHash> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::hash(&bytes))
    }

    pub fn verify(value: &[u8], expected: &ContentHash) -> bool {
        match expected.algorithm {
            HashAlgorithm::Sha256 => Self::hash(value) == *expected,
        }
    }
}
