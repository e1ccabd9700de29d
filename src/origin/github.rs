//! GitHub REST origin.
//!
//! Operation types map to path templates; `{name}` placeholders are filled
//! from params and leftover params become the query string. Unknown
//! operations may pass a raw `endpoint` param instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};

use super::rate_limit::{EndpointCategory, RateLimiterSet};
use super::{Origin, Params};
use crate::error::OriginError;

/// GitHub API base URL
pub const API_BASE_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";

/// Param carrying a raw API path for operations without a template
const RAW_ENDPOINT_PARAM: &str = "endpoint";

/// Operation type -> REST path template
const OPERATIONS: &[(&str, &str)] = &[
    ("get_repo", "/repos/{owner}/{repo}"),
    ("list_repos", "/orgs/{org}/repos"),
    ("list_branches", "/repos/{owner}/{repo}/branches"),
    ("list_workflows", "/repos/{owner}/{repo}/actions/workflows"),
    ("list_languages", "/repos/{owner}/{repo}/languages"),
    ("list_contributors", "/repos/{owner}/{repo}/contributors"),
    ("get_commit", "/repos/{owner}/{repo}/commits/{ref}"),
    ("list_pulls", "/repos/{owner}/{repo}/pulls"),
    ("get_pull", "/repos/{owner}/{repo}/pulls/{number}"),
    ("list_pull_files", "/repos/{owner}/{repo}/pulls/{number}/files"),
    ("get_content", "/repos/{owner}/{repo}/contents/{file}"),
    ("list_code_scanning_alerts", "/repos/{owner}/{repo}/code-scanning/alerts"),
    ("list_workflow_runs", "/repos/{owner}/{repo}/actions/runs"),
    ("get_workflow_run", "/repos/{owner}/{repo}/actions/runs/{run_id}"),
    ("list_check_runs", "/repos/{owner}/{repo}/commits/{ref}/check-runs"),
    ("get_combined_status", "/repos/{owner}/{repo}/commits/{ref}/status"),
    ("get_rate_limit", "/rate_limit"),
    ("search_code", "/search/code"),
    ("search_issues", "/search/issues"),
];

/// Resolve an operation to `(path, query params)`
pub fn resolve_path(
    operation: &str,
    params: &Params,
) -> Result<(String, Vec<(String, String)>), OriginError> {
    let template = OPERATIONS
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, t)| *t);

    let Some(template) = template else {
        let raw = params
            .get(RAW_ENDPOINT_PARAM)
            .ok_or_else(|| OriginError::UnknownOperation(operation.to_string()))?;
        let path = if raw.starts_with('/') {
            raw.clone()
        } else {
            format!("/{}", raw)
        };
        let query = params
            .iter()
            .filter(|(k, _)| k.as_str() != RAW_ENDPOINT_PARAM)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        return Ok((path, query));
    };

    let mut path = String::with_capacity(template.len());
    let mut used = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        path.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| OriginError::UnknownOperation(operation.to_string()))?;
        let name = &rest[start + 1..end];
        let value = params.get(name).ok_or_else(|| OriginError::MissingParam {
            operation: operation.to_string(),
            param: name.to_string(),
        })?;
        path.push_str(value);
        used.push(name);
        rest = &rest[end + 1..];
    }
    path.push_str(rest);

    let query = params
        .iter()
        .filter(|(k, _)| !used.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok((path, query))
}

/// GitHub REST client used as the cache origin
pub struct GitHubOrigin {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
    limiters: RateLimiterSet,
}

impl GitHubOrigin {
    pub fn new(token: Option<String>) -> Result<Self, OriginError> {
        Self::with_base_url(API_BASE_URL, token)
    }

    /// Create a client against a custom API host (GHES or tests)
    pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, OriginError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("fleetcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OriginError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            limiters: RateLimiterSet::new(),
        })
    }

    fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
        if let Some(secs) = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Duration::from_secs(secs);
        }
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        match reset {
            Some(reset) => {
                let wait = reset - chrono::Utc::now().timestamp();
                Duration::from_secs(wait.max(0) as u64)
            }
            None => Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Origin for GitHubOrigin {
    async fn fetch(&self, operation: &str, params: &Params) -> Result<Vec<u8>, OriginError> {
        let (path, query) = resolve_path(operation, params)?;
        let category = EndpointCategory::from_path(&path);

        self.limiters.wait_for(category).await;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .query(&query);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        log::debug!("Origin fetch {} -> {}", operation, path);
        let response = request.send().await.map_err(OriginError::from)?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(|e| {
                    OriginError::InvalidResponse(format!("Failed to read response: {}", e))
                })?;
                Ok(body.to_vec())
            }
            StatusCode::UNAUTHORIZED => Err(OriginError::Unauthorized),
            StatusCode::FORBIDDEN => {
                let exhausted = response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    == Some("0");
                if exhausted {
                    self.limiters.activate(category).await;
                    return Err(OriginError::RateLimit(Self::retry_after(response.headers())));
                }
                let msg = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Forbidden".to_string());
                Err(OriginError::Forbidden(msg))
            }
            StatusCode::NOT_FOUND => Err(OriginError::NotFound(path)),
            StatusCode::TOO_MANY_REQUESTS => {
                self.limiters.activate(category).await;
                Err(OriginError::RateLimit(Self::retry_after(response.headers())))
            }
            s if s.is_server_error() => {
                let msg = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Server error".to_string());
                Err(OriginError::ServerError(format!("{}: {}", s, msg)))
            }
            s => Err(OriginError::InvalidResponse(format!(
                "Unexpected status {} for {}",
                s, path
            ))),
        }
    }
}
