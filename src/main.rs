use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use plughost::config::Config;
use plughost::plugins::{HostServices, PluginManager};

/// plughost - load, order and run plugin modules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Plugin directory, overriding the configured one
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Load modules into the host scope instead of isolated boundaries
    #[arg(long)]
    no_isolation: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List candidate module files without loading them
    Discover,
    /// Load all plugins, print their status, then shut them down
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load all plugins and keep them running until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_default()?,
    };

    let log_level = if args.debug {
        Level::DEBUG
    } else {
        parse_level(&config.logging.level)
    };

    // Logs go to stderr so `status --json` output stays machine-readable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    if let Some(dir) = args.dir {
        config.plugins.directory = dir;
    }
    if args.no_isolation {
        config.plugins.use_isolation = false;
    }

    let mut host = HostServices::new();
    host.insert(config.clone());
    let manager = PluginManager::from_config(&config.plugins, host);

    match args.command.unwrap_or(Command::Run) {
        Command::Discover => {
            let loader = manager.loader();
            for path in loader.discover(&config.plugins.directory, loader.search_pattern()) {
                println!("{}", path.display());
            }
        }
        Command::Status { json } => {
            let cancel = CancellationToken::new();
            manager.load_configured(&cancel).await?;

            let plugins = manager.plugins().await;
            if json {
                let infos: Vec<_> = plugins.values().collect();
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else if plugins.is_empty() {
                println!("No plugins loaded from {}", config.plugins.directory.display());
            } else {
                for info in plugins.values() {
                    println!("{info}");
                }
            }

            manager.shutdown_all(&cancel).await;
        }
        Command::Run => {
            let cancel = CancellationToken::new();
            if config.plugins.auto_load_on_startup {
                let count = manager.load_configured(&cancel).await?;
                info!(count, "Plugins running, press Ctrl-C to stop");
            } else {
                info!("Automatic plugin loading disabled, press Ctrl-C to stop");
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested");

            manager.shutdown_all(&CancellationToken::new()).await;
        }
    }

    Ok(())
}

fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or_else(|_| {
        // The subscriber is not installed yet
        eprintln!("Unknown log level '{level}', using info");
        Level::INFO
    })
}
