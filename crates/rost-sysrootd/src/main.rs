//! rost-sysrootd - Sysroot state coordinator daemon
//!
//! Usage:
//!   rost-sysrootd [--config FILE] [--sysroot DIR] [--socket PATH]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rost_config::logging::{init_logging, LogLevel};
use rost_config::Config;
use rost_sysrootd::run_daemon;

#[derive(Parser)]
#[command(name = "rost-sysrootd")]
#[command(version, about = "Sysroot state coordinator", long_about = None)]
struct Cli {
    /// Config file, layered over /etc/rost/sysrootd.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Physical root holding ostree/repo and ostree/deploy
    #[arg(long)]
    sysroot: Option<PathBuf>,

    /// Control socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Quiet period before reloading after a change, in seconds
    #[arg(long)]
    debounce_secs: Option<u64>,

    /// Forward our stdout to the active transaction
    #[arg(long)]
    capture_stdout: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(path) = self.sysroot {
            config.sysroot.path = path;
        }
        if let Some(socket) = self.socket {
            config.daemon.socket = socket;
        }
        if let Some(secs) = self.debounce_secs {
            config.sysroot.debounce_secs = secs;
        }
        if self.capture_stdout {
            config.daemon.capture_stdout = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let level: LogLevel = config
        .logging
        .level
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    init_logging(level);

    run_daemon(config).await
}
