//! Scan skip commands
//!
//! `check` reports through its exit status so workflow steps can branch on
//! it directly: 0 means reuse the cached scan, 1 means run.

use std::path::Path;

use log::warn;

use crate::cli::{CommandContext, OutputFormat, ScanTarget};
use crate::error::Result;
use crate::scan::{SkipDecision, hash_files};

/// Returns true when the scan can be skipped. Failures count as "run".
pub async fn check(ctx: &CommandContext, target: &ScanTarget) -> Result<bool> {
    let cache = ctx.scan_cache(Path::new(&target.repo_dir))?;
    let config = target.scan_config();

    let decision = match cache.check(&target.repo, &target.commit, &config).await {
        Ok(d) => d,
        Err(e) => {
            warn!("Scan cache check failed, scan will run: {}", e);
            report_run(ctx, target, &e.to_string())?;
            return Ok(false);
        }
    };

    match decision {
        SkipDecision::Skip { ref cached } => match ctx.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "repo": target.repo,
                    "commit": target.commit,
                    "skip": true,
                    "cached_commit": cached.commit_sha,
                    "result_ref": cached.result_ref,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Pretty => {
                println!(
                    "Skip: reuse scan of {} ({})",
                    short_sha(&cached.commit_sha),
                    cached.result_ref
                );
            }
        },
        SkipDecision::Run { ref reason } => report_run(ctx, target, &reason.to_string())?,
    }

    Ok(decision.is_skip())
}

fn report_run(ctx: &CommandContext, target: &ScanTarget, reason: &str) -> Result<()> {
    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "repo": target.repo,
                "commit": target.commit,
                "skip": false,
                "reason": reason,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => println!("Run: {}", reason),
    }
    Ok(())
}

pub fn record(ctx: &CommandContext, target: &ScanTarget, result_ref: &str, files: &[String]) -> Result<()> {
    let repo_dir = Path::new(&target.repo_dir);
    let cache = ctx.scan_cache(repo_dir)?;
    let hashes = hash_files(repo_dir, files)?;
    let entry = cache.record(&target.repo, &target.commit, &target.scan_config(), result_ref, hashes)?;

    match ctx.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
        OutputFormat::Pretty => println!(
            "Recorded scan of {} at {} ({} file hashes)",
            entry.repo,
            short_sha(&entry.commit_sha),
            entry.file_hashes.len()
        ),
    }
    Ok(())
}

pub fn stats(ctx: &CommandContext) -> Result<()> {
    let cache = ctx.scan_cache(Path::new("."))?;
    let stats = cache.stats()?;

    match ctx.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Pretty => {
            println!("Scans skipped:  {}", stats.scans_skipped);
            println!("Scans run:      {}", stats.scans_run);
            println!("Time saved:     ~{} min", stats.time_saved_estimate.as_secs() / 60);
        }
    }
    Ok(())
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
