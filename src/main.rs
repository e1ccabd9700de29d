//! fleetcache CLI - shared, encrypted cache for CI runners

use anyhow::Context;
use clap::{CommandFactory, Parser};

use fleetcache::cli::{
    self, CacheCommands, Cli, CommandContext, Commands, GlobalOptions, ScanCommands, SecretCommands,
};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "fleetcache=debug" } else { "fleetcache=warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}

/// Run the command and return the process exit code
async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "fleetcache", &mut std::io::stdout());
        return Ok(0);
    }

    let opts = GlobalOptions::from_cli(&cli);
    let ctx = CommandContext::new(&opts).context("loading configuration")?;

    match cli.command {
        Commands::Serve => cli::serve::run(&ctx).await?,
        Commands::Get { operation, params } => cli::get::run(&ctx, &operation, &params).await?,
        Commands::Cache(cmd) => match cmd {
            CacheCommands::Status => cli::cache::status(&ctx)?,
            CacheCommands::Clear => cli::cache::clear(&ctx)?,
            CacheCommands::Path => cli::cache::path(&ctx)?,
            CacheCommands::Invalidate { key } => cli::cache::invalidate(&ctx, &key)?,
        },
        Commands::Secret(cmd) => match cmd {
            SecretCommands::Put { id, scope, ttl, value } => {
                cli::secret::put(&ctx, &id, &scope, ttl, value.as_deref())?
            }
            SecretCommands::Get { id, scope } => cli::secret::get(&ctx, &id, &scope)?,
            SecretCommands::Revoke { id } => cli::secret::revoke(&ctx, &id)?,
            SecretCommands::Audit { limit } => cli::secret::audit(&ctx, limit)?,
        },
        Commands::Scan(cmd) => match cmd {
            ScanCommands::Check { target } => {
                let skip = cli::scan::check(&ctx, &target).await?;
                return Ok(if skip { 0 } else { 1 });
            }
            ScanCommands::Record { target, result_ref, files } => {
                cli::scan::record(&ctx, &target, &result_ref, &files)?
            }
            ScanCommands::Stats => cli::scan::stats(&ctx)?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(0)
}
