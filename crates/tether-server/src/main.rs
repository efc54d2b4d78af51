//! Tether Server - Binary entry point

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether::{logging, LocalHost, TetherConfig};

#[derive(Parser)]
#[command(name = "tether-server", version, about = "Tether edge server")]
struct Args {
    /// Configuration file (default: ~/.config/tether/tether.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overriding proxy.bind
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TetherConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.proxy.bind = bind;
    }
    logging::init_logging(&config.logging)?;

    tether_server::run_server(config, Arc::new(LocalHost::new())).await
}
