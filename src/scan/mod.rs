//! Scan result cache with change-based skipping.
//!
//! Entries are keyed by repository and scan-configuration hash. A new commit
//! can reuse the last scan for the same configuration when none of the files
//! changed since that scan's commit is relevant to the configuration. If the
//! diff cannot be computed the scan runs.

pub mod diff;
pub mod storage;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use diff::{DiffProvider, GitDiff};
pub use storage::ScanStore;

use crate::clock::Clock;
use crate::content::{ContentAddresser, ContentHash};
use crate::error::ScanError;

const SCANS_RUN: &str = "scans_run";
const SCANS_SKIPPED: &str = "scans_skipped";

/// What a scan looks at. Two configs with the same hash produce the same scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default)]
    pub query_suites: Vec<String>,

    /// Only paths under these prefixes are scanned (all paths when empty)
    #[serde(default)]
    pub include_paths: Vec<String>,

    #[serde(default)]
    pub ignore_paths: Vec<String>,
}

impl ScanConfig {
    /// Order-insensitive hash of the configuration
    pub fn config_hash(&self) -> ContentHash {
        // plain strings and vecs always serialize
        ContentAddresser::hash_json(&self.normalized()).unwrap_or_else(|_| ContentAddresser::hash(b""))
    }

    fn normalized(&self) -> ScanConfig {
        fn sorted(values: &[String], lowercase: bool) -> Vec<String> {
            let set: BTreeSet<String> = values
                .iter()
                .map(|v| if lowercase { v.trim().to_lowercase() } else { v.trim().to_string() })
                .filter(|v| !v.is_empty())
                .collect();
            set.into_iter().collect()
        }
        ScanConfig {
            languages: sorted(&self.languages, true),
            query_suites: sorted(&self.query_suites, false),
            include_paths: sorted(&self.include_paths, false),
            ignore_paths: sorted(&self.ignore_paths, false),
        }
    }

    /// Whether a change to `path` can alter this configuration's results
    pub fn is_relevant(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");

        if self.ignore_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return false;
        }
        if !self.include_paths.is_empty()
            && !self.include_paths.iter().any(|p| path.starts_with(p.as_str()))
        {
            return false;
        }
        if is_scan_definition(path) {
            return true;
        }
        if self.languages.is_empty() {
            return true;
        }

        let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_lowercase();
        self.languages
            .iter()
            .any(|lang| language_extensions(lang).contains(&ext.as_str()))
    }
}

/// Workflow definitions and CodeQL configuration
fn is_scan_definition(path: &str) -> bool {
    let is_yaml = path.ends_with(".yml") || path.ends_with(".yaml");
    (path.starts_with(".github/workflows/") && is_yaml)
        || path.starts_with(".github/codeql/")
        || (is_yaml
            && Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("codeql-config")))
}

fn language_extensions(language: &str) -> &'static [&'static str] {
    match language.trim().to_lowercase().as_str() {
        "javascript" | "typescript" | "javascript-typescript" => {
            &["js", "jsx", "mjs", "cjs", "ts", "tsx", "mts", "cts", "vue", "html"]
        }
        "python" => &["py", "pyi"],
        "java" | "kotlin" | "java-kotlin" => &["java", "kt", "kts"],
        "go" => &["go"],
        "ruby" => &["rb", "erb", "gemspec"],
        "csharp" => &["cs", "cshtml", "razor", "csproj"],
        "cpp" | "c-cpp" | "c" => &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"],
        "swift" => &["swift"],
        "rust" => &["rs"],
        _ => &[],
    }
}

/// One completed scan. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCacheEntry {
    pub repo: String,
    pub config_hash: ContentHash,
    pub commit_sha: String,
    /// Where the scan's results live (artifact id, SARIF path, ...)
    pub result_ref: String,
    pub file_hashes: BTreeMap<String, ContentHash>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    NoCachedScan,
    RelevantChanges(Vec<String>),
    DiffUnavailable(String),
}

impl std::fmt::Display for RunReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunReason::NoCachedScan => write!(f, "no cached scan for this configuration"),
            RunReason::RelevantChanges(files) => {
                write!(f, "{} relevant file(s) changed", files.len())
            }
            RunReason::DiffUnavailable(reason) => write!(f, "diff unavailable: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Reuse this earlier scan
    Skip { cached: ScanCacheEntry },
    Run { reason: RunReason },
}

impl SkipDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, SkipDecision::Skip { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub scans_skipped: u64,
    pub scans_run: u64,
    /// `scans_skipped` times the configured average scan duration
    #[serde(rename = "time_saved_estimate_secs", serialize_with = "as_secs")]
    pub time_saved_estimate: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

pub struct ScanCache {
    store: Mutex<ScanStore>,
    diff: Arc<dyn DiffProvider>,
    clock: Arc<dyn Clock>,
    average_scan_duration: Duration,
}

impl ScanCache {
    pub fn new(
        store: ScanStore,
        diff: Arc<dyn DiffProvider>,
        clock: Arc<dyn Clock>,
        average_scan_duration: Duration,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            diff,
            clock,
            average_scan_duration,
        }
    }

    fn store(&self) -> MutexGuard<'_, ScanStore> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self, counter: &str) {
        if let Err(e) = self.store().bump(counter) {
            warn!("Failed to update scan counter {}: {}", counter, e);
        }
    }

    /// Decide whether scanning `commit` of `repo` under `config` can be skipped
    pub async fn check(&self, repo: &str, commit: &str, config: &ScanConfig) -> Result<SkipDecision, ScanError> {
        let decision = self.decide(repo, commit, config).await?;
        match &decision {
            SkipDecision::Skip { cached } => {
                info!("Skipping scan of {}@{}: reusing {}", repo, commit, cached.commit_sha);
                self.bump(SCANS_SKIPPED);
            }
            SkipDecision::Run { reason } => {
                info!("Scanning {}@{}: {}", repo, commit, reason);
                self.bump(SCANS_RUN);
            }
        }
        Ok(decision)
    }

    async fn decide(&self, repo: &str, commit: &str, config: &ScanConfig) -> Result<SkipDecision, ScanError> {
        let config_hash = config.config_hash();
        let cached = self.store().latest(repo, &config_hash)?;
        let Some(cached) = cached else {
            return Ok(SkipDecision::Run {
                reason: RunReason::NoCachedScan,
            });
        };

        if cached.commit_sha == commit {
            return Ok(SkipDecision::Skip { cached });
        }

        let changed = match self.diff.changed_files(&cached.commit_sha, commit).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("{}", e);
                return Ok(SkipDecision::Run {
                    reason: RunReason::DiffUnavailable(e.to_string()),
                });
            }
        };

        let relevant: Vec<String> = changed
            .into_iter()
            .filter(|path| config.is_relevant(path))
            .collect();
        debug!("{} relevant change(s) since {}", relevant.len(), cached.commit_sha);

        if relevant.is_empty() {
            Ok(SkipDecision::Skip { cached })
        } else {
            Ok(SkipDecision::Run {
                reason: RunReason::RelevantChanges(relevant),
            })
        }
    }

    /// `check` reduced to a yes/no; any failure means "scan"
    pub async fn should_skip(&self, repo: &str, commit: &str, config: &ScanConfig) -> bool {
        match self.check(repo, commit, config).await {
            Ok(decision) => decision.is_skip(),
            Err(e) => {
                warn!("Scan cache lookup failed, scanning: {}", e);
                false
            }
        }
    }

    /// Record a completed scan, superseding the previous one for this config
    pub fn record(
        &self,
        repo: &str,
        commit: &str,
        config: &ScanConfig,
        result_ref: &str,
        file_hashes: BTreeMap<String, ContentHash>,
    ) -> Result<ScanCacheEntry, ScanError> {
        let entry = ScanCacheEntry {
            repo: repo.to_string(),
            config_hash: config.config_hash(),
            commit_sha: commit.to_string(),
            result_ref: result_ref.to_string(),
            file_hashes,
            created_at: self.clock.now(),
        };
        self.store().put(&entry)?;
        Ok(entry)
    }

    pub fn stats(&self) -> Result<ScanStats, ScanError> {
        let store = self.store();
        let scans_skipped = store.counter(SCANS_SKIPPED)?;
        let scans_run = store.counter(SCANS_RUN)?;
        Ok(ScanStats {
            scans_skipped,
            scans_run,
            time_saved_estimate: self.average_scan_duration.saturating_mul(scans_skipped as u32),
        })
    }
}

/// Content hashes of `paths` (relative to `root`) for recording with a scan
pub fn hash_files(root: &Path, paths: &[String]) -> std::io::Result<BTreeMap<String, ContentHash>> {
    paths
        .iter()
        .map(|p| {
            let bytes = std::fs::read(root.join(p))?;
            Ok((p.clone(), ContentAddresser::hash(&bytes)))
        })
        .collect()
}
