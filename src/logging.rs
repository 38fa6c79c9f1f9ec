//! Tracing subscriber set-up

use crate::config::LoggingConfig;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;

/// Install the global subscriber.
///
/// Logs go to stderr unless `directory` is configured, in which case they
/// are written to a daily rolling file. The returned guard must be kept
/// alive for the file writer to flush; dropping it early loses buffered
/// lines. Installing twice is not an error, the first subscriber wins.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_level = std::env::var("RUST_LOG").ok();
    let level = resolve_log_level(env_level.as_deref().unwrap_or(&config.level));

    match &config.directory {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                )
            })?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "quietproxy");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(non_blocking)
                .with_ansi(false)
                .try_init();
            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .try_init();
            Ok(None)
        }
    }
}

pub fn resolve_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}
