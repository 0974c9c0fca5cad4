//! Logging setup
//!
//! NIST 800-53: AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
//! Implementation: Text or JSON output, to stderr or a daily-rolling file

use heron_sftp::config::{LogFormat, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The returned guard must be held for the
/// lifetime of the process when logging to a file.
pub fn init(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.clone()))
    };

    if let Some(log_file) = &logging.file {
        if let (Some(parent), Some(file_name)) = (log_file.parent(), log_file.file_name()) {
            match std::fs::create_dir_all(parent) {
                Ok(()) => {
                    let file_appender =
                        tracing_appender::rolling::daily(parent, file_name.to_string_lossy().as_ref());
                    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                    match logging.format {
                        LogFormat::Json => {
                            tracing_subscriber::fmt()
                                .json()
                                .with_env_filter(filter())
                                .with_writer(non_blocking)
                                .with_current_span(true)
                                .with_span_list(true)
                                .init();
                        }
                        LogFormat::Text => {
                            tracing_subscriber::fmt()
                                .with_env_filter(filter())
                                .with_writer(non_blocking)
                                .init();
                        }
                    }
                    return Some(guard);
                }
                Err(e) => {
                    eprintln!("Warning: Failed to create log directory: {}", e);
                    eprintln!("Falling back to stderr logging");
                }
            }
        }
    }

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
    None
}
