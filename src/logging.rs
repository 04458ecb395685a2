use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

use tracing_appender::{
    non_blocking::{self, WorkerGuard},
    rolling::RollingFileAppender,
};
use tracing_subscriber::{fmt, prelude::*, reload, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "harvester.log";
const KEEP_ROTATED: usize = 10;

static FILE_FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceCell::new();
static _GUARD: OnceCell<WorkerGuard> = OnceCell::new(); // keep writer alive

pub fn log_dir() -> PathBuf {
    crate::settings::app_support_dir().join("logs")
}

fn file_filter(enabled: bool) -> EnvFilter {
    if enabled {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("off")
    }
}

/// Initialize the global subscriber. Call once at startup.
///
/// Console output goes to stderr (stdout carries the JSON control protocol),
/// filtered by `RUST_LOG` with an `info` default. The file layer rotates daily
/// and can be switched on and off at runtime.
pub fn init(file_enabled: bool) {
    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);

    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (nb_writer, guard): (non_blocking::NonBlocking, WorkerGuard) =
        tracing_appender::non_blocking(file_appender);
    let _ = _GUARD.set(guard);

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_ansi(true);

    let file_layer = fmt::layer()
        .with_writer(nb_writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_line_number(true);

    let (reloadable_filter, handle) = reload::Layer::new(file_filter(file_enabled));
    let _ = FILE_FILTER_HANDLE.set(handle);

    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The reloadable layer must sit directly on the Registry for the handle type to line up.
    let _ = tracing_subscriber::registry()
        .with(file_layer.with_filter(reloadable_filter))
        .with(console.with_filter(console_filter))
        .try_init();

    prune_old_logs(&dir, KEEP_ROTATED);
}

/// Enable/disable file logging after startup.
pub fn set_file_logging_enabled(enabled: bool) {
    if let Some(h) = FILE_FILTER_HANDLE.get() {
        if let Err(e) = h.modify(|f| *f = file_filter(enabled)) {
            tracing::warn!("could not switch file logging: {e}");
        }
    }
}

/// Keep the newest `keep` rotated log files.
fn prune_old_logs(dir: &Path, keep: usize) {
    use std::fs;

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut files: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .collect();

    files.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok()); // oldest first

    if files.len() > keep {
        let excess = files.len() - keep;
        for e in files.iter().take(excess) {
            let _ = fs::remove_file(e.path());
        }
    }
}
