//! Wire format: length-prefixed JSON envelopes.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! JSON. Payloads inside the envelope are AES-GCM ciphertext, base64 encoded.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PROTOCOL_ID;
use crate::cache::{CacheEntry, EntryOrigin};
use crate::content::ContentHash;
use crate::crypto::{CryptoBox, Key};
use crate::error::{CryptoError, PeerError};

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request an entry by key
    Get,
    /// Push an entry and expect an `Ack`
    Put,
    /// Push an entry, no reply
    Broadcast,
    Found,
    NotFound,
    Ack,
    Rejected,
}

/// Who sent a message, so receivers can learn new peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub peer_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub message_type: MessageType,
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub payload: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub nonce: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,

    /// Unix seconds; receivers keep the original expiry rather than restarting it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Envelope {
    fn bare(message_type: MessageType, key: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_ID.to_string(),
            message_type,
            key: key.to_string(),
            payload: None,
            nonce: None,
            content_hash: None,
            created_at: None,
            ttl_seconds: None,
            operation: None,
            sender: None,
            reason: None,
        }
    }

    pub fn get(key: &str, sender: Option<Sender>) -> Self {
        Self {
            sender,
            ..Self::bare(MessageType::Get, key)
        }
    }

    pub fn not_found(key: &str) -> Self {
        Self::bare(MessageType::NotFound, key)
    }

    pub fn ack(key: &str) -> Self {
        Self::bare(MessageType::Ack, key)
    }

    pub fn rejected(key: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare(MessageType::Rejected, key)
        }
    }

    /// Envelope carrying an encrypted entry (`Found`, `Put` or `Broadcast`)
    pub fn carrying(
        message_type: MessageType,
        entry: &CacheEntry,
        operation: Option<&str>,
        sender: Option<Sender>,
        shared_key: &Key,
    ) -> Result<Self, CryptoError> {
        let sealed = CryptoBox::encrypt(shared_key, &entry.value)?;
        Ok(Self {
            payload: Some(sealed.ciphertext),
            nonce: Some(sealed.nonce.to_vec()),
            content_hash: Some(entry.content_hash.clone()),
            created_at: Some(entry.created_at.timestamp()),
            ttl_seconds: Some(entry.ttl_seconds),
            operation: operation.map(str::to_string),
            sender,
            ..Self::bare(message_type, &entry.key)
        })
    }

    pub fn check_protocol(&self) -> Result<(), PeerError> {
        if self.protocol_version != PROTOCOL_ID {
            return Err(PeerError::ProtocolMismatch {
                expected: PROTOCOL_ID.to_string(),
                actual: self.protocol_version.clone(),
            });
        }
        Ok(())
    }

    /// Decrypt the payload into an entry. The content hash is NOT checked here;
    /// callers must run `CacheEntry::verify` before trusting it.
    pub fn open(&self, shared_key: &Key) -> Result<CacheEntry, PeerError> {
        let missing = |field: &str| PeerError::Frame(format!("{} missing from {:?}", field, self.message_type));

        let payload = self.payload.as_ref().ok_or_else(|| missing("payload"))?;
        let nonce = self.nonce.as_ref().ok_or_else(|| missing("nonce"))?;
        let content_hash = self.content_hash.clone().ok_or_else(|| missing("content_hash"))?;
        let created_at = self
            .created_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or_else(|| missing("created_at"))?;
        let ttl_seconds = self.ttl_seconds.ok_or_else(|| missing("ttl_seconds"))?;

        let value = CryptoBox::decrypt(shared_key, payload, nonce).map_err(|_| PeerError::Decrypt)?;

        Ok(CacheEntry {
            key: self.key.clone(),
            value,
            content_hash,
            created_at,
            ttl_seconds,
            origin: EntryOrigin::Peer,
        })
    }
}

/// Write one envelope as a frame
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope).map_err(|e| PeerError::Frame(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(PeerError::Frame(format!("frame of {} bytes exceeds limit", body.len())));
    }

    let io_err = |e: std::io::Error| PeerError::Frame(e.to_string());
    writer.write_u32(body.len() as u32).await.map_err(io_err)?;
    writer.write_all(&body).await.map_err(io_err)?;
    writer.flush().await.map_err(io_err)?;
    Ok(())
}

/// Read one frame and decode its envelope
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, PeerError>
where
    R: AsyncRead + Unpin,
{
    let io_err = |e: std::io::Error| PeerError::Frame(e.to_string());
    let len = reader.read_u32().await.map_err(io_err)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(PeerError::Frame(format!("frame of {} bytes exceeds limit", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(io_err)?;
    serde_json::from_slice(&body).map_err(|e| PeerError::Frame(e.to_string()))
}

mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
