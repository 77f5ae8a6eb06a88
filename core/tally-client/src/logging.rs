//! File logging for the client.
//!
//! stdout carries command output, so logs go to a daily-rolling file under
//! `~/.chat-tally/logs/`. The returned guard flushes the non-blocking writer
//! on drop and must be held for the life of the process.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_LOG_ENV: &str = "CHAT_TALLY_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "tally-client.log";

pub fn init() -> Option<WorkerGuard> {
    let log_dir = tally_core::log_dir().ok()?;
    fs_err::create_dir_all(&log_dir).ok()?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let installed = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(filter())
        .try_init()
        .is_ok();

    installed.then_some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
