// widget-sync - Frontend widget model synchronization
//
// The library keeps frontend widget models in step with their kernel-side
// counterparts over comm channels. This binary exercises it end to end.
//
// Architecture:
// - Manager: creates models for frontend- and kernel-opened comms
// - Model: attribute state, echo suppression, send throttling, lifecycle
// - Comm: in-process transport whose frames the simulated kernel consumes
// - Recorder: writes frames to JSON Lines files for later analysis
// - Config: ~/.config/widget-sync/config.toml plus WIDGET_SYNC_* env vars

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::time::Duration;
use widget_sync::config::Config;
use widget_sync::demo::{self, DemoOptions};
use widget_sync::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config commands run without loading the file so a broken one can be fixed
    if let Some(Commands::Config { show, reset, path }) = cli.command {
        return cli::handle_config(show, reset, path);
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists()?;
    let config = Config::load()?;

    // Precedence: RUST_LOG env var > config file > default "info"
    // The guard must outlive the session so file logs get flushed
    let _log_guard = logging::init(&config.logging)?;

    let mut options = DemoOptions::from_config(&config);
    if let Some(Commands::Demo {
        delay_ms,
        record_dir,
    }) = cli.command
    {
        if let Some(ms) = delay_ms {
            options.delay = Duration::from_millis(ms);
        }
        if record_dir.is_some() {
            options.record_dir = record_dir;
        }
    }

    tracing::info!(
        max_pending = config.sync.max_pending_msgs,
        comm_target = %config.sync.comm_target,
        "Starting demo session"
    );

    tokio::select! {
        summary = demo::run_demo(&config, options) => {
            let summary = summary?;
            println!();
            println!(
                "{} frames ({} open, {} msg, {} close)",
                summary.frames.total(),
                summary.frames.open,
                summary.frames.msg,
                summary.frames.close
            );
            if let Some(path) = summary.recording {
                println!("Recorded to {}", path.display());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
