//! Append-only audit trail for credential access
//!
//! Every record goes to an in-memory list and, when enabled, to `audit.log`
//! as one JSON line. The file is created owner-only. Records carry ids,
//! scopes and decisions; never secret material.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use super::Scope;
use crate::error::DenyReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
    Stored,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub credential_id: String,
    pub requester_scope: Scope,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

pub struct AuditLog {
    path: Option<PathBuf>,
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    /// Log that also appends to `path`
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Log kept in memory only
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record.
    ///
    /// A file write failure is logged and does not fail the credential
    /// operation; the in-memory record is always kept.
    pub fn record(&self, record: AuditRecord) {
        if let Some(ref path) = self.path
            && let Err(e) = append_line(path, &record)
        {
            warn!("Failed to write audit log {}: {}", path.display(), e);
        }
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    /// Records written through this handle
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Every record in an audit file, oldest first. Unparseable lines are skipped.
    pub fn read_file(path: &Path) -> std::io::Result<Vec<AuditRecord>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

fn append_line(path: &Path, record: &AuditRecord) -> std::io::Result<()> {
    let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    line.push('\n');

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
