//! Logging bootstrap
//!
//! Rolling file output (text or JSON) plus a coloured console layer in text
//! mode. `RUST_LOG` overrides the configured level.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Directive string: configured level, with sqlx statement logging muted
fn filter_directives(config: &AppConfig) -> String {
    format!("{},sqlx=warn,hyper=warn", config.log_level)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, otherwise
/// buffered file output is dropped on exit.
pub fn init_logging(config: &AppConfig) -> Result<WorkerGuard, TryInitError> {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Targets stay in JSON so records can be grouped by module
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).try_init()?;
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let console_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(console_layer).try_init()?;
    }

    Ok(guard)
}
