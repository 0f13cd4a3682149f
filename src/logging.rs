use crate::cli::{Args, LogLevel};
use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter that colors the whole line by level.
///
/// Console output stays free of timestamps and level tags so diagnostics read
/// cleanly next to the report lines on stdout.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // format_fields writes directly, so buffer it to color the full line
        let mut buffer = String::new();
        ctx.format_fields(Writer::new(&mut buffer), event)?;

        writeln!(writer, "{}", colorize(*event.metadata().level(), &buffer))
    }
}

fn colorize(level: Level, line: &str) -> ColoredString {
    match level {
        Level::INFO => line.white(),
        Level::WARN => line.yellow(),
        Level::ERROR => line.red(),
        Level::DEBUG => line.blue(),
        Level::TRACE => line.purple(),
    }
}

/// Filter directive implied by `-q`, repeated `-v` and `--log-level`
///
/// The flags win over the configured level.
pub fn default_directive(verbose: u8, quiet: bool, level: Option<LogLevel>) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => level.map_or("info", LogLevel::directive),
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the verbosity flags. Diagnostics go to
/// stderr through `ColorizedFormatter`; with `--log-file` they are also
/// written, uncolored and timestamped, through a non-blocking appender. Keep
/// the returned guard alive until exit so the file writer flushes.
pub fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args.verbose, args.quiet, args.log_level)));

    let console = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    Ok(guard)
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path {:?} has no file name", path))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {:?}", directory))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0, false, None), "info");
        assert_eq!(default_directive(1, false, None), "debug");
        assert_eq!(default_directive(4, false, None), "trace");
        assert_eq!(default_directive(3, true, None), "warn");
    }

    #[test]
    fn test_configured_level_yields_to_flags() {
        assert_eq!(default_directive(0, false, Some(LogLevel::Error)), "error");
        assert_eq!(default_directive(0, false, Some(LogLevel::Debug)), "debug");
        assert_eq!(default_directive(2, false, Some(LogLevel::Error)), "trace");
        assert_eq!(default_directive(0, true, Some(LogLevel::Debug)), "warn");
    }

    #[test]
    fn test_colorize_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(colorize(Level::WARN, "careful").to_string(), "careful");
        colored::control::unset_override();
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bench.log");

        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
