//! Cache management commands

use crate::cli::{CommandContext, OutputFormat};
use crate::error::Result;

/// Show disk cache status/statistics
pub fn status(ctx: &CommandContext) -> Result<()> {
    let cache = ctx.disk_only_cache()?;
    let path = ctx.config.cache_dir()?.display().to_string();
    let Some(stats) = cache.disk_stats()? else {
        println!("Disk cache disabled");
        return Ok(());
    };

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "total_entries": stats.total_entries,
                "valid_entries": stats.valid_entries,
                "expired_entries": stats.expired_entries,
                "total_size_bytes": stats.total_size_bytes,
                "total_size_human": format_size(stats.total_size_bytes),
                "oldest_entry_timestamp": stats.oldest_entry,
                "newest_entry_timestamp": stats.newest_entry,
                "path": path,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            println!("Cache Status");
            println!("────────────────────────────────────────");
            println!("Location:       {}", path);
            println!("Valid entries:  {}", stats.valid_entries);
            println!("Expired:        {}", stats.expired_entries);
            println!("Total size:     {}", format_size(stats.total_size_bytes));

            if let Some(oldest) = stats.oldest_entry {
                println!("Oldest entry:   {}", format_timestamp(oldest));
            }
            if let Some(newest) = stats.newest_entry {
                println!("Newest entry:   {}", format_timestamp(newest));
            }
        }
    }

    Ok(())
}

/// Clear all disk cache entries
pub fn clear(ctx: &CommandContext) -> Result<()> {
    let stats = ctx.disk_only_cache()?.clear()?;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "entries_removed": stats.entries_removed,
                "success": true,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            if stats.entries_removed > 0 {
                println!("Cleared {} cache entries", stats.entries_removed);
            } else {
                println!("Cache was already empty");
            }
        }
    }

    Ok(())
}

/// Show cache path
pub fn path(ctx: &CommandContext) -> Result<()> {
    println!("{}", ctx.config.cache_dir()?.display());
    Ok(())
}

/// Drop one key. Peers keep their copies until those expire.
pub fn invalidate(ctx: &CommandContext, key: &str) -> Result<()> {
    let removed = ctx.disk_only_cache()?.remove(key);

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "key": key, "removed": removed });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            if removed {
                println!("Invalidated {}", key);
                println!(
                    "Peers may serve their copy for up to {}s more",
                    ctx.config.cache.ttl.max_ttl().as_secs()
                );
            } else {
                println!("No entry for {}", key);
            }
        }
    }

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|d| {
            d.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Format bytes as human-readable size
fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_timestamp_out_of_range() {
        assert_eq!(format_timestamp(i64::MAX), "unknown");
    }
}
