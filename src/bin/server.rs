//! Controller server binary

use clap::{Parser, Subcommand};
use deployctl::{Config, Controller};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "deployctl-server")]
#[command(about = "Deployment controller with versioned deployment history")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Config file (TOML). Defaults to ./deployctl.toml when present
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Concurrent store operations
        #[arg(long)]
        max_conns: Option<usize>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            db,
            max_conns,
            log_level,
        } => {
            // File and environment first, CLI flags have priority
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(db) = db {
                config.store.db_path = db;
            }
            if let Some(max_conns) = max_conns {
                config.store.max_conns = max_conns;
            }
            if let Some(level) = log_level {
                config.server.log_level = level;
            }
            config.store.validate()?;

            let level = config.server.log_level.clone();
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| level.into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Controller::new(config).serve().await?;
        }
    }

    Ok(())
}
