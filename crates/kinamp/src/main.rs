//! kinamp: play a playlist of local audio files through the kinamp-player backend.
//!
//! A decode thread writes fixed-format PCM into a named pipe; a render pipeline reads it
//! and plays it on the output device. The shell owns the playlist cursor and the event
//! loop, and saves playlist, index and strategy on exit.

mod cli;
mod config;
mod cursor;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,kinamp=info,kinamp_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let cfg = config::RunConfig::from_args(&args);
    let cursor = runtime::load_cursor(&cfg)?;
    runtime::run(cfg, cursor)
}
