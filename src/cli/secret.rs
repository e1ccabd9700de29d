//! Scoped secret commands

use std::io::Read;
use std::time::Duration;

use crate::cli::{CommandContext, OutputFormat};
use crate::credentials::{AuditLog, AuditRecord, Scope};
use crate::error::{Error, Result};

pub fn put(
    ctx: &CommandContext,
    id: &str,
    scope: &str,
    ttl_secs: Option<u64>,
    value: Option<&str>,
) -> Result<()> {
    let scope: Scope = scope.parse()?;
    let plaintext = match value {
        Some(v) => v.to_string(),
        None => read_stdin()?,
    };
    if plaintext.is_empty() {
        return Err(Error::Other("refusing to store an empty secret".to_string()));
    }

    let store = ctx.credential_store()?;
    store.put(id, &plaintext, scope.clone(), ttl_secs.map(Duration::from_secs))?;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "id": id,
                "scope": scope.to_string(),
                "ttl_seconds": ttl_secs,
                "stored": true,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => println!("Stored {} ({})", id, scope),
    }
    Ok(())
}

/// Print the secret value; denials surface as errors
pub fn get(ctx: &CommandContext, id: &str, scope: &str) -> Result<()> {
    let requester: Scope = scope.parse()?;
    let store = ctx.credential_store()?;
    let secret = store.get(id, &requester)?;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "id": id, "value": secret.expose() });
            println!("{}", serde_json::to_string(&json)?);
        }
        OutputFormat::Pretty => println!("{}", secret.expose()),
    }
    Ok(())
}

pub fn revoke(ctx: &CommandContext, id: &str) -> Result<()> {
    let removed = ctx.credential_store()?.revoke(id)?;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "id": id, "revoked": removed });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            if removed {
                println!("Revoked {}", id);
            } else {
                println!("No credential named {}", id);
            }
        }
    }
    Ok(())
}

pub fn audit(ctx: &CommandContext, limit: Option<usize>) -> Result<()> {
    let mut records = AuditLog::read_file(&ctx.audit_log_path()?)?;
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }

    match ctx.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Pretty => {
            if records.is_empty() {
                println!("No audit records");
            }
            for record in &records {
                println!("{}", format_record(record));
            }
        }
    }
    Ok(())
}

fn format_record(record: &AuditRecord) -> String {
    let decision = serde_json::to_value(record.decision)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let mut line = format!(
        "{}  {:<8} {:<24} {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        decision,
        record.credential_id,
        record.requester_scope
    );
    if let Some(reason) = record.reason {
        line.push_str(&format!("  ({})", reason));
    }
    line
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Decision;
    use crate::error::DenyReason;

    #[test]
    fn test_format_record_includes_reason() {
        let record = AuditRecord {
            timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            credential_id: "deploy-key".to_string(),
            requester_scope: Scope::repo("octo/app"),
            decision: Decision::Denied,
            reason: Some(DenyReason::ScopeMismatch),
        };

        let line = format_record(&record);
        assert!(line.starts_with("1970-01-01 00:00:00"));
        assert!(line.contains("denied"));
        assert!(line.contains("repo:octo/app"));
        assert!(line.ends_with("(scope mismatch)"));
    }
}
