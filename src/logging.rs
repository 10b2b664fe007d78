//! Tracing setup for the daemon.
//!
//! Prefers the systemd journal when one is reachable, so worker and reaper
//! events show up under `journalctl` with their structured fields intact.
//! Anywhere else (or when the journal socket is missing) events go to a
//! daily-rotated log file instead.
//!
//! Verbosity is read from the `PHOTOSIFT_LOG` environment variable using
//! the usual `EnvFilter` directives, e.g. `PHOTOSIFT_LOG=photosift=debug`.
//! Unset means `info`.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Dropping the guard would silently stop the background log writer, so it
// lives for the whole process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Call once, before any worker threads
/// start; `log_dir` overrides the default file location when the journal
/// is unavailable.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let filter =
        EnvFilter::try_from_env("PHOTOSIFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    if let Ok(journald) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter)
            .with(journald)
            .init();
        tracing::info!("Logging to journald");
        return Ok(());
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, "photosift.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    tracing::info!("Logging to {:?}", log_dir);
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photosift")
        .join("logs")
}
