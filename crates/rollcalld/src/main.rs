use anyhow::{Context, Result};
use rollcall_core::StopReason;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

/// How long Ctrl-C waits for the loop to finish its current frame.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::from_env();
    config.validate().context("invalid configuration")?;
    let source = match &config.replay_dir {
        Some(dir) => format!("replay:{}", dir.display()),
        None => config.stream_url.clone(),
    };
    tracing::info!(
        source = %source,
        attendance = %config.attendance_url,
        data_dir = %config.data_dir.display(),
        preview = %config.preview_path.display(),
        "configuration loaded"
    );

    let mut engine = engine::spawn_engine(&config).context("failed to start recognition engine")?;
    tracing::info!("rollcalld ready");

    let outcome = tokio::select! {
        result = engine.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping after the current frame");
            engine.request_quit();
            match tokio::time::timeout(SHUTDOWN_GRACE, engine.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "engine did not stop in time; exiting");
                    return Ok(());
                }
            }
        }
    };

    match outcome.context("recognition loop failed")? {
        StopReason::EndOfStream => tracing::info!("stream ended; rollcalld shutting down"),
        StopReason::Quit => tracing::info!("rollcalld shutting down"),
    }
    Ok(())
}
