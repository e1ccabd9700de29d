//! Origin collaborators: what the cache calls on a full miss.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{Error, OriginError};

pub mod github;
pub mod rate_limit;

pub use github::GitHubOrigin;

/// Request parameters, ordered so keys and URLs are stable
pub type Params = BTreeMap<String, String>;

/// Source of truth behind the cache.
///
/// Errors are returned to the `ApiCache` caller unchanged; implementations
/// decide nothing about retries.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, operation: &str, params: &Params) -> Result<Vec<u8>, OriginError>;
}

/// Parse `k=v` pairs (as given on the command line) into params
pub fn parse_params<S: AsRef<str>>(pairs: &[S]) -> crate::error::Result<Params> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| Error::Other(format!("bad parameter '{}', expected k=v", pair)))
        })
        .collect()
}
