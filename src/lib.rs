//! xtunnel - named SSH-tunneled TCP forwarders
//!
//! Each tunnel maps a local listening address to a remote `host:port`
//! reached through a password-authenticated SSH relay. `TunnelManager` is the
//! registry callers drive; the forwarding engine and relay sessions live
//! underneath it.

pub mod commands;
pub mod config;
pub mod forwarding;
pub mod ssh;
pub mod tunnel;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{TunnelConfig, TunnelDefinition, TunnelSettings, TunnelStore};
pub use ssh::RusshConnector;
pub use tunnel::{TunnelError, TunnelEvent, TunnelInfo, TunnelManager, TunnelStatus};

/// Append a line to the startup log (useful when stderr is not visible)
pub fn write_startup_log(message: &str) {
    if let Ok(log_dir) = config::log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);

        let log_file = log_dir.join("startup.log");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_file) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
    }
}

/// Number of daily log files kept in the log directory
const LOG_BACKUP_LIMIT: usize = 50;

/// Daily rotating `xtunnel.<date>.log` files in `dir`
fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("xtunnel")
        .filename_suffix("log")
        .max_log_files(LOG_BACKUP_LIMIT)
        .build(dir)
}

/// Initialize logging
///
/// Every line goes to stdout and to a daily rotating file under
/// `config::log_dir()`. `RUST_LOG` overrides the default `info` filter.
/// Keep the returned guard alive until exit so buffered lines are flushed.
pub fn init_logging() -> Option<WorkerGuard> {
    let appender = config::log_dir()
        .map_err(|e| e.to_string())
        .and_then(|dir| file_appender(&dir).map_err(|e| e.to_string()));

    let (file_layer, guard, file_error) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("File logging disabled: {}", e);
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_appender_writes_daily_file() {
        let temp = tempdir().unwrap();
        let log_dir = temp.path().join("logs");

        let mut appender = file_appender(&log_dir).unwrap();
        writeln!(appender, "tunnel db running").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("xtunnel."));
        assert!(names[0].ends_with(".log"));

        let contents = std::fs::read_to_string(log_dir.join(&names[0])).unwrap();
        assert!(contents.contains("tunnel db running"));
    }
}
