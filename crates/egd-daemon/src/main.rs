//! egdd — entropy gathering daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use egd_core::config::DaemonConfig;
use egd_daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "egdd")]
#[command(about = "Entropy gathering daemon")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Skip the single-instance lock check
    #[arg(long)]
    force: bool,

    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    Daemon::new(config).run(args.force).await
}
