//! CLI command definitions and handlers

use clap::{Parser, Subcommand};
pub use clap_complete::Shell;

pub mod args;
pub mod cache;
pub mod context;
pub mod get;
pub mod scan;
pub mod secret;
pub mod serve;

pub use args::{GlobalOptions, OutputFormat};
pub use context::CommandContext;

/// fleetcache - shared, encrypted cache for CI runners
#[derive(Parser, Debug)]
#[command(name = "fleetcache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (pretty, json)
    #[arg(
        long,
        global = true,
        env = "FLEETCACHE_FORMAT",
        default_value = "pretty",
        hide_env = true,
        hide_possible_values = true
    )]
    pub format: OutputFormat,

    /// Override config file location
    #[arg(long, global = true, env = "FLEETCACHE_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = "FLEETCACHE_DEBUG", hide_env = true)]
    pub debug: bool,

    /// Bypass every cache layer, fetch fresh data from the origin
    #[arg(long, global = true, env = "FLEETCACHE_NO_CACHE", hide_env = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a peer node until interrupted
    Serve,

    /// Fetch an API response through the cache
    #[command(after_help = "\
Examples:
  fleetcache get get_repo -p owner=octo -p repo=app
  fleetcache get list_check_runs -p owner=octo -p repo=app -p ref=main
  fleetcache get custom -p endpoint=/repos/octo/app/environments")]
    Get {
        /// Operation type (get_repo, list_pulls, ...), selects path and TTL
        operation: String,

        /// Parameters as key=value
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Manage the local response cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Store and retrieve scoped secrets
    #[command(subcommand)]
    Secret(SecretCommands),

    /// Decide whether a code scan can be skipped, and record scans
    #[command(subcommand)]
    Scan(ScanCommands),

    /// Generate shell completions
    #[command(after_help = "\
  bash:   fleetcache completions bash > /etc/bash_completion.d/fleetcache
  zsh:    fleetcache completions zsh > \"${fpath[1]}/_fleetcache\"
  fish:   fleetcache completions fish > ~/.config/fish/completions/fleetcache.fish")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show disk cache statistics
    Status,

    /// Remove every entry from the disk cache
    Clear,

    /// Print the disk cache directory
    Path,

    /// Remove one key from the local layers
    Invalidate {
        /// Cache key as printed by `get --format json`
        key: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    /// Store a secret (value read from stdin unless --value is given)
    Put {
        id: String,

        /// global, repo:<owner/name>, workflow:<name>, runner:<name>; `/*` suffix matches a prefix
        #[arg(long, default_value = "global")]
        scope: String,

        /// Lifetime in seconds (no expiry when omitted)
        #[arg(long)]
        ttl: Option<u64>,

        /// Secret value (avoid: visible in process listings)
        #[arg(long)]
        value: Option<String>,
    },

    /// Print a secret if the requesting scope is allowed
    Get {
        id: String,

        /// Scope of the requester
        #[arg(long, default_value = "global")]
        scope: String,
    },

    /// Delete a secret immediately
    Revoke { id: String },

    /// Show the access audit log
    Audit {
        /// Only the most recent N records
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScanCommands {
    /// Exit 0 if the scan can be skipped, 1 if it must run
    Check {
        #[command(flatten)]
        target: ScanTarget,
    },

    /// Record a completed scan
    Record {
        #[command(flatten)]
        target: ScanTarget,

        /// Where the results live (artifact name, SARIF path, ...)
        #[arg(long)]
        result_ref: String,

        /// Files to hash into the record, relative to --repo-dir
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Show skip statistics
    Stats,
}

/// Repository, commit and scan configuration
#[derive(Debug, Clone, clap::Args)]
pub struct ScanTarget {
    /// Repository (owner/name)
    #[arg(long)]
    pub repo: String,

    /// Commit SHA being scanned
    #[arg(long)]
    pub commit: String,

    /// Local checkout used for diffs
    #[arg(long, default_value = ".")]
    pub repo_dir: String,

    #[arg(long = "language", value_delimiter = ',')]
    pub languages: Vec<String>,

    #[arg(long = "query-suite", value_delimiter = ',')]
    pub query_suites: Vec<String>,

    #[arg(long = "include", value_delimiter = ',')]
    pub include_paths: Vec<String>,

    #[arg(long = "ignore", value_delimiter = ',')]
    pub ignore_paths: Vec<String>,
}

impl ScanTarget {
    pub fn scan_config(&self) -> crate::scan::ScanConfig {
        crate::scan::ScanConfig {
            languages: self.languages.clone(),
            query_suites: self.query_suites.clone(),
            include_paths: self.include_paths.clone(),
            ignore_paths: self.ignore_paths.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_get_collects_params() {
        let cli = Cli::parse_from([
            "fleetcache", "get", "get_repo", "-p", "owner=octo", "--param", "repo=app",
        ]);
        match cli.command {
            Commands::Get { operation, params } => {
                assert_eq!(operation, "get_repo");
                assert_eq!(params, vec!["owner=octo", "repo=app"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_scan_target_splits_lists() {
        let cli = Cli::parse_from([
            "fleetcache", "scan", "check", "--repo", "octo/app", "--commit", "abc",
            "--language", "python,go", "--ignore", "docs/",
        ]);
        let Commands::Scan(ScanCommands::Check { target }) = cli.command else {
            panic!("expected scan check");
        };
        let config = target.scan_config();
        assert_eq!(config.languages, vec!["python", "go"]);
        assert_eq!(config.ignore_paths, vec!["docs/"]);
        assert_eq!(target.repo_dir, ".");
    }
}
