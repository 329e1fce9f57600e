use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::io::IsTerminal;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Stderr line format.
///
/// Progress lines are printed bare, like the records on stdout. Warnings and
/// errors carry their level so they stay visible when colors are off.
pub struct DiagnosticFormatter;

fn render(level: Level, message: &str, ansi: bool) -> String {
    let line = match level {
        Level::WARN | Level::ERROR => format!("{}: {}", level, message),
        _ => message.to_string(),
    };
    if !ansi {
        return line;
    }
    match level {
        Level::ERROR => line.red().to_string(),
        Level::WARN => line.yellow().to_string(),
        Level::INFO => line,
        _ => line.dimmed().to_string(),
    }
}

impl<S, N> FormatEvent<S, N> for DiagnosticFormatter
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
        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;
        let ansi = writer.has_ansi_escapes();
        writeln!(writer, "{}", render(*event.metadata().level(), &message, ansi))
    }
}

/// Default filter directive for the verbosity flags.
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    }
}

/// Install the global subscriber: diagnostics on stderr (colored on a
/// terminal) and, with
/// `log_file`, plain lines in that file. `RUST_LOG` overrides the flags.
///
/// The returned guard flushes the file writer on drop and must live until
/// the process exits.
pub fn init_logging(verbose: u8, quiet: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    let console = tracing_subscriber::fmt::layer()
        .event_format(DiagnosticFormatter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
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
        .context("Failed to install the log subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_directive(0, false), "info");
        assert_eq!(default_directive(1, false), "debug");
        assert_eq!(default_directive(5, false), "trace");
        assert_eq!(default_directive(2, true), "warn");
    }

    #[test]
    fn warnings_and_errors_carry_their_level() {
        assert_eq!(render(Level::INFO, "Sending data...", false), "Sending data...");
        assert_eq!(render(Level::DEBUG, "poll", false), "poll");
        assert_eq!(render(Level::WARN, "late pong", false), "WARN: late pong");
        assert!(render(Level::ERROR, "bind failed", true).contains("ERROR: bind failed"));
    }
}
