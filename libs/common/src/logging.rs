//! Logging bootstrap for acquisition services
//!
//! Console output always uses the bracketed format
//! `2025-12-02T00:50:44.809123Z [INFO] message`; an optional daily rolling
//! file receives the same lines (or JSON when requested).

use std::path::{Path, PathBuf};
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

/// Environment variable that overrides the configured log directory
pub const LOG_DIR_ENV: &str = "ACQ_LOG_DIR";

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

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message fields`
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
            write!(
                writer,
                "{}{}\x1b[0m ",
                level_color(&level),
                format_level(&level)
            )?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the whole process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (filter target and file prefix)
    pub service_name: String,
    /// Level applied to the service's own target when `RUST_LOG` is unset
    pub level: Level,
    /// Directory for the rolling log file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Write the file layer as JSON lines
    pub enable_json: bool,
    /// Colorize console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "acqsrv".to_string(),
            level: Level::INFO,
            log_dir: None,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Parse a level name (`trace`..`error`), case-insensitive
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse::<Level>().ok()
}

/// Resolve the effective log directory
///
/// Priority: environment override > configured directory > none.
pub fn resolve_log_dir(env_value: Option<String>, configured: Option<&Path>) -> Option<PathBuf> {
    env_value
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| configured.map(Path::to_path_buf))
}

/// Default filter directive when `RUST_LOG` is not set
fn default_directive(config: &LogConfig) -> String {
    format!(
        "info,{}={}",
        config.service_name.replace('-', "_"),
        config.level.as_str().to_lowercase()
    )
}

/// Install the global subscriber
///
/// Returns an error if a subscriber is already installed or the log
/// directory cannot be created.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => EnvFilter::new(env_str),
        _ => EnvFilter::new(default_directive(&config)),
    };

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let log_dir = resolve_log_dir(std::env::var(LOG_DIR_ENV).ok(), config.log_dir.as_deref());

    let file_layer = match &log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut slot) => slot.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_level(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} (console only)", config.service_name),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_level_brackets() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_env_dir_wins_over_config() {
        let configured = PathBuf::from("/var/log/acq");
        assert_eq!(
            resolve_log_dir(Some("/tmp/override".into()), Some(&configured)),
            Some(PathBuf::from("/tmp/override"))
        );
        assert_eq!(
            resolve_log_dir(Some("  ".into()), Some(&configured)),
            Some(configured.clone())
        );
        assert_eq!(resolve_log_dir(None, None), None);
    }

    #[test]
    fn test_default_directive_uses_service_target() {
        let config = LogConfig {
            service_name: "acq-srv".into(),
            level: Level::DEBUG,
            ..LogConfig::default()
        };
        assert_eq!(default_directive(&config), "info,acq_srv=debug");
    }
}
