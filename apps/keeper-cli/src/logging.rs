//! Logging initialization and log file management.
//!
//! Provides dual-output tracing: stderr (human-readable) and, when a log
//! directory is given, a daily rolling JSON file `keeper.<YYYY-MM-DD>.log`
//! in that directory.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Maximum age of log files before cleanup, in days.
const LOG_RETENTION_DAYS: u64 = 3;

const LOG_FILE_PREFIX: &str = "keeper";
const LOG_FILE_SUFFIX: &str = "log";

/// Initialize the tracing subscriber with stderr output.
///
/// When `log_dir` is `Some`, an additional JSON file layer writes to a
/// daily rolling file in that directory.
///
/// Returns an optional [`WorkerGuard`] that must be held for the lifetime
/// of the program to flush buffered logs.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the rolling
/// file cannot be opened.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let (non_blocking, guard) = open_log_writer(log_dir)?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(env_filter()),
        )
        .init();
    Ok(Some(guard))
}

/// `RUST_LOG`, or `info` when unset or invalid.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Create the log directory and a daily rolling appender in it.
fn open_log_writer(log_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(log_dir)
        .with_context(|| format!("failed to open log file in {}", log_dir.display()))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Remove `.log` files older than 3 days from `log_dir`.
///
/// Best-effort: failures on individual files are reported with `eprintln!`
/// (tracing is not initialized yet) and never abort startup.
pub fn cleanup_old_logs(log_dir: &Path) {
    if !log_dir.is_dir() {
        return;
    }
    let cutoff = SystemTime::now() - Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("warning: failed to read log directory {}: {e}", log_dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(LOG_FILE_SUFFIX) {
            continue;
        }

        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("warning: failed to read metadata for {}: {e}", path.display());
                continue;
            }
        };

        if modified < cutoff
            && let Err(e) = fs::remove_file(&path)
        {
            eprintln!("warning: failed to remove old log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(path: &Path, days: u64) {
        let then = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(then))
            .expect("should set mtime");
    }

    #[test]
    fn test_should_cleanup_old_log_files() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let recent = tmp.path().join("keeper.2026-10-17.log");
        let old = tmp.path().join("keeper.2026-10-01.log");
        fs::write(&recent, "recent").expect("should write");
        fs::write(&old, "old").expect("should write");
        backdate(&old, 4);

        cleanup_old_logs(tmp.path());

        assert!(recent.exists(), "recent log file should be preserved");
        assert!(!old.exists(), "old log file should be removed");
    }

    #[test]
    fn test_should_skip_non_log_files() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let notes = tmp.path().join("notes.txt");
        fs::write(&notes, "notes").expect("should write");
        backdate(&notes, 10);

        cleanup_old_logs(tmp.path());

        assert!(notes.exists(), "non-.log files should not be removed");
    }

    #[test]
    fn test_should_leave_subdirectories_alone() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let nested = tmp.path().join("archive");
        fs::create_dir_all(&nested).expect("should create dir");
        let nested_log = nested.join("keeper.2020-01-01.log");
        fs::write(&nested_log, "old").expect("should write");
        backdate(&nested_log, 30);

        cleanup_old_logs(tmp.path());

        assert!(nested_log.exists());
    }

    #[test]
    fn test_should_handle_nonexistent_log_dir() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        cleanup_old_logs(&tmp.path().join("missing"));
    }

    #[test]
    fn test_should_create_log_dir_and_rolling_file() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let log_dir = tmp.path().join("logs");

        let (_writer, _guard) = open_log_writer(&log_dir).expect("should open writer");

        assert!(log_dir.is_dir(), "log directory should be created");
        let names: Vec<String> = fs::read_dir(&log_dir)
            .expect("should read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1, "exactly one log file should be created");
        assert!(names[0].starts_with("keeper."));
        assert!(names[0].ends_with(".log"));
    }

    #[test]
    fn test_should_fail_for_uncreatable_log_dir() {
        let result = open_log_writer(Path::new("/dev/null/logs"));
        assert!(result.is_err(), "should fail when directory cannot be created");
    }
}
