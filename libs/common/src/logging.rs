//! Unified logging setup for the facility services
//!
//! Console output uses a bracketed-level format; an optional daily-rolling
//! file layer is written through a non-blocking appender.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the configured log directory
pub const LOG_DIR_ENV: &str = "DEVSRV_LOG_DIR";

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

/// Event formatter that outputs: `timestamp [LEVEL] target: message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] devsrv::shutdown: Sequence 3 completed`
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
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

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

        write!(writer, "{}: ", event.metadata().target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and default filter target
    pub service_name: String,
    /// Directory for the rolling log file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Console level when `RUST_LOG` is not set
    pub console_level: Level,
    /// Emit JSON lines to the file instead of plain text
    pub enable_json: bool,
    /// Disable ANSI colors on the console
    pub no_color: bool,
}

impl LogConfig {
    /// Console-only configuration at the given level
    pub fn console(service_name: impl Into<String>, level: Level) -> Self {
        Self {
            service_name: service_name.into(),
            log_dir: None,
            console_level: level,
            enable_json: false,
            no_color: false,
        }
    }

    /// Attach a log directory
    pub fn with_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

/// Parse a log level string, defaulting to INFO
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Resolve the log directory
///
/// Priority: `DEVSRV_LOG_DIR` environment variable > configured directory.
pub fn resolve_log_dir(configured: Option<&str>) -> Option<PathBuf> {
    std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| configured.filter(|dir| !dir.is_empty()).map(PathBuf::from))
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.is_empty() => EnvFilter::new(env_str),
        _ => {
            let level = config.console_level.as_str().to_ascii_lowercase();
            EnvFilter::new(format!("{level},{}={level}", config.service_name))
        },
    }
}

/// Initialize the global subscriber
///
/// Returns the file appender guard when file logging is enabled; the caller
/// must keep it alive for the lifetime of the process.
pub fn init_with_config(
    config: LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(build_filter(&config));

    let console_layer = fmt::layer()
        .with_ansi(!config.no_color)
        .event_format(BracketedLevelFormat)
        .boxed();

    let Some(log_dir) = config.log_dir.as_ref() else {
        registry.with(console_layer).try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let appender =
        tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .with_writer(non_blocking)
            .boxed()
    };

    registry.with(console_layer).with(file_layer).try_init()?;
    Ok(Some(guard))
}
