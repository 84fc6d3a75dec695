use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use relay::{
    config,
    engine::Engine,
    runtime::{Runtime, Tune},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Connection-oriented TCP reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Proxy declaration (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Global connection ceiling.
    #[arg(short = 'n', long, default_value_t = 2_000)]
    maxconn: u32,

    /// Per-session buffer size in bytes.
    #[arg(long, default_value_t = 16_384)]
    bufsize: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)?;
    let cfg: config::Config = serde_json::from_str(&raw)?;

    let proxies = config::build(&cfg)?;
    let maxconn = cfg.maxconn.unwrap_or(args.maxconn);
    let tune = Tune { bufsize: args.bufsize, ..Tune::default() };

    let mut engine = Engine::new(proxies, Runtime::new(maxconn, tune))?;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&stop))?;
    }

    info!(maxconn, "relay started");
    engine.run(&stop);
    Ok(())
}
