//! Credential store lifecycle against real files and simulated time

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fleetcache::clock::ManualClock;
use fleetcache::credentials::{AuditLog, CredentialStore, Decision, Scope};
use fleetcache::crypto::{MIN_PBKDF2_ITERATIONS, MasterKeyStore};
use fleetcache::error::{CredentialError, DenyReason};

fn open(dir: &TempDir, clock: Arc<ManualClock>) -> CredentialStore {
    let key = MasterKeyStore::new(dir.path().join("master.key"), None, MIN_PBKDF2_ITERATIONS)
        .load_or_create()
        .unwrap();
    let audit = AuditLog::to_file(dir.path().join("audit.log"));
    CredentialStore::open(dir.path(), key, audit, clock).unwrap()
}

fn denial(err: CredentialError) -> DenyReason {
    err.deny_reason().expect("expected an access denial")
}

#[test]
fn secrets_survive_reopen_and_expire_on_schedule() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());

    {
        let store = open(&dir, clock.clone());
        store
            .put("npm-token", "tok-123", Scope::repo("octo/*"), Some(Duration::from_secs(3600)))
            .unwrap();
        store.put("deploy-key", "key-456", Scope::global(), None).unwrap();
    }

    // Same master key file, same ciphertexts
    let store = open(&dir, clock.clone());
    assert_eq!(store.len(), 2);
    let secret = store.get("npm-token", &Scope::repo("octo/app")).unwrap();
    assert_eq!(secret.expose(), "tok-123");

    clock.advance(Duration::from_secs(3600));
    assert!(store.get("npm-token", &Scope::repo("octo/app")).is_ok());

    clock.advance(Duration::from_secs(1));
    let err = store.get("npm-token", &Scope::repo("octo/app")).unwrap_err();
    assert_eq!(denial(err), DenyReason::Expired);
    // Removed on first expired access
    let err = store.get("npm-token", &Scope::repo("octo/app")).unwrap_err();
    assert_eq!(denial(err), DenyReason::NotFound);

    // Global secrets answer every requester and never expire
    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert_eq!(store.get("deploy-key", &Scope::runner("linux-1")).unwrap().expose(), "key-456");
}

#[test]
fn every_access_leaves_one_audit_record() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let store = open(&dir, clock.clone());

    store.put("db", "pw", Scope::workflow("release"), None).unwrap();
    assert!(store.get("db", &Scope::workflow("release")).is_ok());
    assert_eq!(denial(store.get("db", &Scope::workflow("nightly")).unwrap_err()), DenyReason::ScopeMismatch);
    assert_eq!(denial(store.get("db", &Scope::repo("release")).unwrap_err()), DenyReason::ScopeMismatch);
    assert_eq!(denial(store.get("missing", &Scope::global()).unwrap_err()), DenyReason::NotFound);
    assert!(store.revoke("db").unwrap());
    assert_eq!(denial(store.get("db", &Scope::workflow("release")).unwrap_err()), DenyReason::NotFound);

    let on_disk = AuditLog::read_file(&dir.path().join("audit.log")).unwrap();
    assert_eq!(on_disk, store.audit().records());

    let decisions: Vec<(Decision, Option<DenyReason>)> =
        on_disk.iter().map(|r| (r.decision, r.reason)).collect();
    assert_eq!(
        decisions,
        vec![
            (Decision::Stored, None),
            (Decision::Granted, None),
            (Decision::Denied, Some(DenyReason::ScopeMismatch)),
            (Decision::Denied, Some(DenyReason::ScopeMismatch)),
            (Decision::Denied, Some(DenyReason::NotFound)),
            (Decision::Revoked, None),
            (Decision::Denied, Some(DenyReason::NotFound)),
        ]
    );

    // Ids and scopes only
    let raw = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
    assert!(!raw.contains("\"pw\""));
}

#[test]
fn store_file_holds_no_plaintext() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, Arc::new(ManualClock::starting_now()));
    store
        .put("gh", "ghp_very_secret_value", Scope::global(), None)
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
    assert!(raw.contains("\"gh\""));
    assert!(!raw.contains("ghp_very_secret_value"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("credentials.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
