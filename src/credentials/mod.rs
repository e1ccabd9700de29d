//! Encrypted, scoped, expiring secrets.
//!
//! Secrets are sealed with AES-256-GCM under the installation master key and
//! persisted to an owner-only `credentials.json`. Each `get` is decided by
//! existence, expiry, scope and decryption, in that order, and leaves exactly
//! one audit record whatever the outcome.

pub mod audit;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use audit::{AuditLog, AuditRecord, Decision};

use crate::clock::Clock;
use crate::crypto::{CryptoBox, Key, NONCE_LEN};
use crate::error::{CredentialError, DenyReason};
use crate::files::write_owner_only;

type Result<T> = std::result::Result<T, CredentialError>;

const STORE_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeLevel {
    Global,
    Repo,
    Workflow,
    Runner,
}

impl ScopeLevel {
    fn as_str(&self) -> &'static str {
        match self {
            ScopeLevel::Global => "global",
            ScopeLevel::Repo => "repo",
            ScopeLevel::Workflow => "workflow",
            ScopeLevel::Runner => "runner",
        }
    }
}

/// Where a secret may be used, or who is asking for it.
///
/// Textual form: `global`, `repo:<matcher>`, `workflow:<matcher>`,
/// `runner:<matcher>`. A stored matcher ending in `/*` matches any requester
/// matcher with that prefix (`repo:org/*` covers `repo:org/app`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub level: ScopeLevel,
    pub matcher: String,
}

impl Scope {
    pub fn global() -> Self {
        Self {
            level: ScopeLevel::Global,
            matcher: String::new(),
        }
    }

    pub fn repo(matcher: &str) -> Self {
        Self::at(ScopeLevel::Repo, matcher)
    }

    pub fn workflow(matcher: &str) -> Self {
        Self::at(ScopeLevel::Workflow, matcher)
    }

    pub fn runner(matcher: &str) -> Self {
        Self::at(ScopeLevel::Runner, matcher)
    }

    fn at(level: ScopeLevel, matcher: &str) -> Self {
        Self {
            level,
            matcher: matcher.to_string(),
        }
    }

    /// Does this (stored) scope admit `requester`?
    pub fn admits(&self, requester: &Scope) -> bool {
        if self.level == ScopeLevel::Global {
            return true;
        }
        if self.level != requester.level {
            return false;
        }
        match self.matcher.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('/') => requester.matcher.starts_with(prefix),
            _ => self.matcher == requester.matcher,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            ScopeLevel::Global => f.write_str("global"),
            level => write!(f, "{}:{}", level.as_str(), self.matcher),
        }
    }
}

impl FromStr for Scope {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CredentialError::InvalidScope(s.to_string());

        if s == "global" {
            return Ok(Scope::global());
        }
        let (level, matcher) = s.split_once(':').ok_or_else(invalid)?;
        if matcher.is_empty() {
            return Err(invalid());
        }
        let level = match level {
            "repo" => ScopeLevel::Repo,
            "workflow" => ScopeLevel::Workflow,
            "runner" => ScopeLevel::Runner,
            _ => return Err(invalid()),
        };
        Ok(Scope::at(level, matcher))
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decrypted secret. Wiped on drop and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

/// A sealed secret as held in memory and on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(with = "b64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_nonce")]
    pub nonce: [u8; NONCE_LEN],
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

pub struct CredentialStore {
    path: Option<PathBuf>,
    key: Key,
    credentials: Mutex<BTreeMap<String, Credential>>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    /// Store persisted under `dir`
    pub fn open(dir: &Path, key: Key, audit: AuditLog, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = dir.join(STORE_FILE);
        let credentials = load(&path)?;
        debug!("Loaded {} credential(s) from {}", credentials.len(), path.display());

        Ok(Self {
            path: Some(path),
            key,
            credentials: Mutex::new(credentials),
            audit,
            clock,
        })
    }

    /// Store that never touches disk
    pub fn in_memory(key: Key, audit: AuditLog, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            key,
            credentials: Mutex::new(BTreeMap::new()),
            audit,
            clock,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn credentials(&self) -> MutexGuard<'_, BTreeMap<String, Credential>> {
        self.credentials.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, credentials: &BTreeMap<String, Credential>) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(credentials)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        write_owner_only(path, &body)
            .map_err(|e| CredentialError::Storage(format!("{}: {}", path.display(), e)))
    }

    fn audit_event(&self, id: &str, scope: &Scope, decision: Decision, reason: Option<DenyReason>) {
        self.audit.record(AuditRecord {
            timestamp: self.clock.now(),
            credential_id: id.to_string(),
            requester_scope: scope.clone(),
            decision,
            reason,
        });
    }

    /// Apply `change` to a copy of the map and persist it; the live map only
    /// changes once the write succeeded
    fn commit<T>(&self, change: impl FnOnce(&mut BTreeMap<String, Credential>) -> T) -> Result<T> {
        let mut credentials = self.credentials();
        let mut next = credentials.clone();
        let outcome = change(&mut next);
        self.persist(&next)?;
        *credentials = next;
        Ok(outcome)
    }

    /// Seal and store a secret. Last write for an id wins.
    pub fn put(&self, id: &str, plaintext: &str, scope: Scope, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) => Some(expiry(now, ttl)?),
            None => None,
        };
        let sealed = CryptoBox::encrypt(&self.key, plaintext.as_bytes())?;

        let credential = Credential {
            id: id.to_string(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            scope: scope.clone(),
            created_at: now,
            expires_at,
        };

        self.commit(|credentials| credentials.insert(id.to_string(), credential))?;

        info!("Stored credential {} for {}", id, scope);
        self.audit_event(id, &scope, Decision::Stored, None);
        Ok(())
    }

    /// Decrypt `id` for `requester`, or deny with a reason
    pub fn get(&self, id: &str, requester: &Scope) -> Result<SecretString> {
        let result = self.decide(id, requester);
        match &result {
            Ok(_) => self.audit_event(id, requester, Decision::Granted, None),
            Err(e) => self.audit_event(id, requester, Decision::Denied, e.deny_reason()),
        }
        result
    }

    fn decide(&self, id: &str, requester: &Scope) -> Result<SecretString> {
        let deny = |reason| CredentialError::AccessDenied {
            id: id.to_string(),
            reason,
        };

        let mut credentials = self.credentials();
        let Some(credential) = credentials.get(id) else {
            return Err(deny(DenyReason::NotFound));
        };

        if credential.is_expired(self.clock.now()) {
            credentials.remove(id);
            if let Err(e) = self.persist(&credentials) {
                log::warn!("Failed to persist removal of expired {}: {}", id, e);
            }
            return Err(deny(DenyReason::Expired));
        }

        if !credential.scope.admits(requester) {
            return Err(deny(DenyReason::ScopeMismatch));
        }

        let plaintext = CryptoBox::decrypt(&self.key, &credential.ciphertext, &credential.nonce)
            .map_err(|_| deny(DenyReason::DecryptError))?;
        let secret = String::from_utf8(plaintext).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            deny(DenyReason::DecryptError)
        })?;
        Ok(SecretString(secret))
    }

    /// Delete `id` immediately; true if it existed
    pub fn revoke(&self, id: &str) -> Result<bool> {
        let removed = if self.credentials().contains_key(id) {
            self.commit(|credentials| credentials.remove(id))?
        } else {
            None
        };

        match removed {
            Some(credential) => {
                info!("Revoked credential {}", id);
                self.audit_event(id, &credential.scope, Decision::Revoked, None);
                Ok(true)
            }
            None => {
                self.audit_event(id, &Scope::global(), Decision::Revoked, Some(DenyReason::NotFound));
                Ok(false)
            }
        }
    }

    /// Delete every expired credential; returns how many
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        if !self.credentials().values().any(|c| c.is_expired(now)) {
            return Ok(0);
        }

        let removed = self.commit(|credentials| {
            let before = credentials.len();
            credentials.retain(|_, c| !c.is_expired(now));
            before - credentials.len()
        })?;
        debug!("Swept {} expired credential(s)", removed);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.credentials().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `now + ttl`, or an error when that is past what a timestamp can hold
fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| CredentialError::InvalidTtl(format!("{}s", ttl.as_secs())))
}

fn load(path: &Path) -> Result<BTreeMap<String, Credential>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| CredentialError::Storage(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(CredentialError::Storage(format!("{}: {}", path.display(), e))),
    }
}

mod b64_bytes {
    use super::B64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_nonce {
    use super::{B64, NONCE_LEN};
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(nonce: &[u8; NONCE_LEN], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; NONCE_LEN], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = B64.decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 12 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn store(clock: Arc<ManualClock>) -> CredentialStore {
        CredentialStore::in_memory(CryptoBox::generate_master_key(), AuditLog::in_memory(), clock)
    }

    #[test]
    fn test_scope_parse_and_display() {
        for text in ["global", "repo:org/app", "workflow:org/app/ci.yml", "runner:linux-x64"] {
            let scope: Scope = text.parse().unwrap();
            assert_eq!(scope.to_string(), text);
        }
        assert!("team:x".parse::<Scope>().is_err());
        assert!("repo:".parse::<Scope>().is_err());
        assert!("repo".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_admits() {
        let stored = Scope::repo("org/app");
        assert!(stored.admits(&Scope::repo("org/app")));
        assert!(!stored.admits(&Scope::repo("org/other")));
        assert!(!stored.admits(&Scope::workflow("org/app")));

        assert!(Scope::global().admits(&Scope::runner("anything")));

        let wildcard = Scope::repo("org/*");
        assert!(wildcard.admits(&Scope::repo("org/app")));
        assert!(!wildcard.admits(&Scope::repo("other/app")));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_put_get_round_trip_including_empty() {
        let s = store(Arc::new(ManualClock::starting_now()));

        s.put("token", "s3cret", Scope::repo("org/app"), None).unwrap();
        s.put("empty", "", Scope::global(), None).unwrap();

        assert_eq!(s.get("token", &Scope::repo("org/app")).unwrap().expose(), "s3cret");
        assert_eq!(s.get("empty", &Scope::runner("r1")).unwrap().expose(), "");
    }

    #[test]
    fn test_each_denial_has_its_reason_and_one_audit_record() {
        let clock = Arc::new(ManualClock::starting_now());
        let s = store(clock.clone());
        s.put("scoped", "a", Scope::repo("org/app"), None).unwrap();
        s.put("short", "b", Scope::global(), Some(Duration::from_secs(60))).unwrap();
        let baseline = s.audit().records().len();

        let reason = |r: Result<SecretString>| r.unwrap_err().deny_reason();

        assert_eq!(reason(s.get("nope", &Scope::global())), Some(DenyReason::NotFound));
        assert_eq!(
            reason(s.get("scoped", &Scope::repo("org/other"))),
            Some(DenyReason::ScopeMismatch)
        );
        clock.advance(Duration::from_secs(61));
        assert_eq!(reason(s.get("short", &Scope::global())), Some(DenyReason::Expired));

        let records = s.audit().records();
        assert_eq!(records.len(), baseline + 3);
        assert!(records[baseline..].iter().all(|r| r.decision == Decision::Denied));
        assert_eq!(records[baseline + 2].reason, Some(DenyReason::Expired));

        // lazily deleted
        assert_eq!(reason(s.get("short", &Scope::global())), Some(DenyReason::NotFound));
    }

    #[test]
    fn test_wrong_key_is_decrypt_error() {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

        let writer = CredentialStore::open(
            dir.path(),
            CryptoBox::generate_master_key(),
            AuditLog::in_memory(),
            clock.clone(),
        )
        .unwrap();
        writer.put("token", "s3cret", Scope::global(), None).unwrap();

        let reader = CredentialStore::open(
            dir.path(),
            CryptoBox::generate_master_key(),
            AuditLog::in_memory(),
            clock,
        )
        .unwrap();
        let err = reader.get("token", &Scope::global()).unwrap_err();

        assert_eq!(err.deny_reason(), Some(DenyReason::DecryptError));
        assert_eq!(reader.audit().records()[0].reason, Some(DenyReason::DecryptError));
    }

    #[test]
    fn test_revoke_is_immediate_and_audited() {
        let s = store(Arc::new(ManualClock::starting_now()));
        s.put("token", "x", Scope::global(), None).unwrap();

        assert!(s.revoke("token").unwrap());
        assert!(!s.revoke("token").unwrap());
        assert_eq!(
            s.get("token", &Scope::global()).unwrap_err().deny_reason(),
            Some(DenyReason::NotFound)
        );

        let decisions: Vec<Decision> = s.audit().records().iter().map(|r| r.decision).collect();
        assert_eq!(
            decisions,
            vec![Decision::Stored, Decision::Revoked, Decision::Revoked, Decision::Denied]
        );
    }

    #[test]
    fn test_sweep_expired() {
        let clock = Arc::new(ManualClock::starting_now());
        let s = store(clock.clone());
        s.put("a", "1", Scope::global(), Some(Duration::from_secs(10))).unwrap();
        s.put("b", "2", Scope::global(), None).unwrap();

        clock.advance(Duration::from_secs(11));

        assert_eq!(s.sweep_expired().unwrap(), 1);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_persisted_file_has_no_plaintext() {
        let dir = TempDir::new().unwrap();
        let key = CryptoBox::generate_master_key();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

        let s = CredentialStore::open(dir.path(), key.clone(), AuditLog::in_memory(), clock.clone()).unwrap();
        s.put("token", "plaintext-marker", Scope::repo("org/app"), None).unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join(STORE_FILE)).unwrap();
        assert!(!on_disk.contains("plaintext-marker"));

        let reopened = CredentialStore::open(dir.path(), key, AuditLog::in_memory(), clock).unwrap();
        assert_eq!(
            reopened.get("token", &Scope::repo("org/app")).unwrap().expose(),
            "plaintext-marker"
        );
    }

    #[test]
    fn test_ttl_past_representable_time_is_rejected() {
        let s = store(Arc::new(ManualClock::starting_now()));

        let result = s.put("tok", "s", Scope::global(), Some(Duration::from_secs(9_000_000_000_000)));

        assert!(matches!(result, Err(CredentialError::InvalidTtl(_))));
        assert!(s.is_empty());
        assert!(s.audit().records().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let s = CredentialStore::open(
            dir.path(),
            CryptoBox::generate_master_key(),
            AuditLog::in_memory(),
            clock,
        )
        .unwrap();
        s.put("kept", "1", Scope::global(), None).unwrap();

        // A directory in place of the store file makes every write fail
        std::fs::remove_file(dir.path().join(STORE_FILE)).unwrap();
        std::fs::create_dir(dir.path().join(STORE_FILE)).unwrap();
        std::fs::write(dir.path().join(STORE_FILE).join("block"), b"").unwrap();

        assert!(matches!(
            s.put("new", "2", Scope::global(), None),
            Err(CredentialError::Storage(_))
        ));
        assert!(s.revoke("kept").is_err());

        assert_eq!(s.len(), 1);
        assert_eq!(s.get("kept", &Scope::global()).unwrap().expose(), "1");
        assert_eq!(
            s.get("new", &Scope::global()).unwrap_err().deny_reason(),
            Some(DenyReason::NotFound)
        );
    }
}
