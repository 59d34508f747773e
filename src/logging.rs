//! Dual-sink file logger.
//!
//! Two sinks under the log directory: an information log honoring the
//! configured level and an error log pinned to ERROR. Events are formatted
//! `LEVEL target: span1:span2: message`, target before span context.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Default log directory
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default information log filename
pub const DEFAULT_INFO_LOG: &str = "log.info";

/// Default error log filename
pub const DEFAULT_ERROR_LOG: &str = "log.error";

/// Settings gathered from the CLI before the logger exists
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub info_name: String,
    pub error_name: String,
    /// None disables the information sink entirely ("off")
    pub info_level: Option<LevelFilter>,
    pub remove_existing: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            info_name: DEFAULT_INFO_LOG.to_string(),
            error_name: DEFAULT_ERROR_LOG.to_string(),
            info_level: Some(LevelFilter::INFO),
            remove_existing: false,
        }
    }
}

/// Parse the `-v` level keyword. Each keyword maps to its own level;
/// `critical` shares ERROR (tracing has no level above it) and `off`
/// disables the sink.
pub fn parse_level(raw: &str) -> Result<Option<LevelFilter>> {
    match raw {
        "trace" => Ok(Some(LevelFilter::TRACE)),
        "debug" => Ok(Some(LevelFilter::DEBUG)),
        "info" => Ok(Some(LevelFilter::INFO)),
        "warning" => Ok(Some(LevelFilter::WARN)),
        "error" | "critical" => Ok(Some(LevelFilter::ERROR)),
        "off" => Ok(None),
        other => anyhow::bail!("unknown log level \"{}\"", other),
    }
}

/// Handles that keep the non-blocking writers flushing; drop them last
pub struct LogGuards {
    _info: WorkerGuard,
    _error: WorkerGuard,
}

/// Create the log directory and both sinks, then install the subscriber
pub fn init(settings: &LogSettings) -> Result<LogGuards> {
    std::fs::create_dir_all(&settings.dir)
        .with_context(|| format!("cannot create log directory {}", settings.dir.display()))?;

    let info_path = settings.dir.join(&settings.info_name);
    let error_path = settings.dir.join(&settings.error_name);

    if settings.remove_existing {
        remove_if_present(&info_path)?;
        remove_if_present(&error_path)?;
    }

    let (info_writer, info_guard) = non_blocking_file(&info_path)?;
    let (error_writer, error_guard) = non_blocking_file(&error_path)?;

    let info_layer = tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat)
        .with_ansi(false)
        .with_writer(info_writer)
        .with_filter(settings.info_level.unwrap_or(LevelFilter::OFF));

    let error_layer = tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat)
        .with_ansi(false)
        .with_writer(error_writer)
        .with_filter(LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(info_layer)
        .with(error_layer)
        .init();

    Ok(LogGuards {
        _info: info_guard,
        _error: error_guard,
    })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove old log file {}", path.display())),
    }
}

fn non_blocking_file(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Event formatter that puts the target before span context
struct TargetFirstFormat;

impl<S, N> FormatEvent<S, N> for TargetFirstFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        write!(writer, "{:>5} ", metadata.level())?;
        write!(writer, "{}: ", metadata.target())?;

        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, ":")?;
                }
                write!(writer, "{}", span.name())?;
                first = false;
            }
            if !first {
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_parse_independently() {
        assert_eq!(parse_level("trace").unwrap(), Some(LevelFilter::TRACE));
        assert_eq!(parse_level("debug").unwrap(), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("info").unwrap(), Some(LevelFilter::INFO));
        assert_eq!(parse_level("warning").unwrap(), Some(LevelFilter::WARN));
        assert_eq!(parse_level("error").unwrap(), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("critical").unwrap(), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("off").unwrap(), None);
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(parse_level("verbose").is_err());
    }
}
