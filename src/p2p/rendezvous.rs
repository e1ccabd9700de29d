//! Rendezvous collaborators: where nodes advertise themselves and find each other.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PROTOCOL_ID;
use crate::error::PeerError;

/// One node's advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advert {
    pub peer_id: String,
    pub address: String,
    pub protocol: String,
    pub advertised_at: DateTime<Utc>,
}

impl Advert {
    pub fn new(peer_id: &str, address: &str, advertised_at: DateTime<Utc>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            protocol: PROTOCOL_ID.to_string(),
            advertised_at,
        }
    }
}

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Publish (or refresh) this node's advert
    async fn advertise(&self, advert: &Advert) -> Result<(), PeerError>;

    /// Every advert currently known, any protocol
    async fn list_advertised(&self) -> Result<Vec<Advert>, PeerError>;
}

/// REST directory: `POST {base}/peers` to advertise, `GET {base}/peers?protocol=..` to list
pub struct HttpRendezvous {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRendezvous {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, PeerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleetcache/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Rendezvous for HttpRendezvous {
    async fn advertise(&self, advert: &Advert) -> Result<(), PeerError> {
        let url = format!("{}/peers", self.base_url);
        let response = self.http.post(&url).json(advert).send().await?;

        if !response.status().is_success() {
            return Err(PeerError::Rendezvous(format!(
                "advertise returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_advertised(&self) -> Result<Vec<Advert>, PeerError> {
        let url = format!("{}/peers", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("protocol", PROTOCOL_ID)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PeerError::Rendezvous(format!(
                "list returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Shared directory of `<peer_id>.json` advert files, for runners on one host
pub struct DirectoryRendezvous {
    dir: PathBuf,
}

impl DirectoryRendezvous {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn advert_path(&self, peer_id: &str) -> PathBuf {
        // peer ids are hex, but don't let a bad one escape the directory
        let safe: String = peer_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl Rendezvous for DirectoryRendezvous {
    async fn advertise(&self, advert: &Advert) -> Result<(), PeerError> {
        let io_err = |e: std::io::Error| PeerError::Rendezvous(e.to_string());
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let body = serde_json::to_vec(advert).map_err(|e| PeerError::Rendezvous(e.to_string()))?;

        // Write then rename so readers never see a half-written advert
        let path = self.advert_path(&advert.peer_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn list_advertised(&self) -> Result<Vec<Advert>, PeerError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PeerError::Rendezvous(e.to_string())),
        };

        let mut adverts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PeerError::Rendezvous(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<Advert>(&bytes) {
                Ok(advert) => adverts.push(advert),
                Err(e) => log::debug!("Skipping unreadable advert {}: {}", path.display(), e),
            }
        }
        Ok(adverts)
    }
}
