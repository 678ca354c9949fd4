//! Unified logging module for the kiosk services
//!
//! Console output always uses the bracketed level format. A daily rolling
//! file layer is added when a log directory is configured.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809000Z [INFO] [cash-1] Online`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the process lifetime
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the default debug target
    pub service_name: String,
    /// Default filter when `RUST_LOG` is not set (e.g. "info")
    pub level: String,
    /// Directory for daily rolling log files; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Build the filter string. `RUST_LOG` wins over the configured level.
    fn filter_directive(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(env_str) if !env_str.is_empty() => env_str,
            _ => self.level.clone(),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// Fails if the filter directive is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let directive = config.filter_directive();
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Logging(format!("Invalid log filter '{}': {}", directive, e)))?;

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => {
                    eprintln!("Warning: GUARDS lock was poisoned, recovering...");
                    poisoned.into_inner().push(guard);
                },
            }

            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            )
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_ansi(config.ansi)
                .event_format(BracketedLevelFormat),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Logging(format!("Failed to install subscriber: {}", e)))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?} ({})", config.service_name, dir, directive),
        None => tracing::info!("Logging: {} console only ({})", config.service_name, directive),
    }

    Ok(())
}
