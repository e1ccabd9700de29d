//! `get`: resolve one API response through the cache

use std::io::Write;

use log::debug;

use crate::cache::CacheEntry;
use crate::cli::{CommandContext, OutputFormat};
use crate::error::Result;
use crate::origin::parse_params;

pub async fn run(ctx: &CommandContext, operation: &str, raw_params: &[String]) -> Result<()> {
    let params = parse_params(raw_params)?;
    let cache = ctx.api_cache().await?;

    let entry = cache.fetch(operation, &params).await?;
    debug!("Resolved {} from {:?}, stats: {:?}", entry.key, entry.origin, cache.stats());

    match ctx.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entry_json(&entry))?);
        }
        OutputFormat::Pretty => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&entry.value)?;
            if !entry.value.ends_with(b"\n") {
                stdout.write_all(b"\n")?;
            }
        }
    }

    // The process exits right after this; give background pushes their window
    let pushed = cache.drain_broadcasts().await;
    if pushed > 0 {
        debug!("Waited on {} broadcast(s)", pushed);
    }

    Ok(())
}

/// JSON bodies are embedded as-is, anything else as a lossy string
fn entry_json(entry: &CacheEntry) -> serde_json::Value {
    let value = serde_json::from_slice::<serde_json::Value>(&entry.value)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&entry.value).into_owned()));

    serde_json::json!({
        "key": entry.key,
        "origin": entry.origin,
        "content_hash": entry.content_hash.to_string(),
        "created_at": entry.created_at.to_rfc3339(),
        "ttl_seconds": entry.ttl_seconds,
        "value": value,
    })
}
