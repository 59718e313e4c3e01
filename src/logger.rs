//! The operator-facing log: every line goes to standard output and to a size-capped, rotating
//! file on disk.
//!
//! Nothing here installs a global subscriber. [init] builds a [Log] handle, and every component
//! that needs to write log messages is given a clone of it.

pub mod rotate;

use crate::config::LogSettings;
use anyhow::{anyhow, Context};
use chrono::Local;
use rotate::RotatingFile;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{dispatcher, Dispatch, Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{self as tracing_fmt, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// The name of the log file inside the log directory.
pub const LOG_FILE: &str = "confpush.log";

/// How wide [Log::separator] lines are.
pub const SEPARATOR_WIDTH: usize = 110;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Fatal entries are error-level events under this target, so [LineFormat] can label them.
const FATAL_TARGET: &str = "confpush::fatal";

/// How loud a log entry is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// NETCONF traffic and other detail, shown with `-v`.
    Debug,

    /// Progress through the fleet: which device, which step, what changed.
    Notice,

    /// A cleanup step failed or an input was ignored. The device still settles.
    Warning,

    /// A device failed and was skipped.
    Error,

    /// The run is being aborted. Printed with a `FATAL:` prefix, and normally the last entry
    /// before the summary.
    Fatal,
}

/// A logging handle for use in other parts of the program.
///
/// Clone one of these and store it in your types that need to send log messages.
#[derive(Clone)]
pub struct Log {
    dispatch: Dispatch,
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").finish_non_exhaustive()
    }
}

impl Log {
    /// Wraps an existing [Dispatch]. Events are only ever sent to this dispatcher, never to the
    /// global default.
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Log { dispatch }
    }

    /// A [Log] that drops everything.
    pub fn disabled() -> Self {
        Log {
            dispatch: Dispatch::none(),
        }
    }

    /// Writes a log entry at the given severity.
    pub fn write(&self, severity: Severity, message: impl Display) {
        dispatcher::with_default(&self.dispatch, || match severity {
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Notice => tracing::info!("{message}"),
            Severity::Warning => tracing::warn!("{message}"),
            Severity::Error => tracing::error!("{message}"),
            Severity::Fatal => tracing::error!(target: FATAL_TARGET, "{message}"),
        });
    }

    pub fn debug(&self, message: impl Display) {
        self.write(Severity::Debug, message);
    }

    pub fn notice(&self, message: impl Display) {
        self.write(Severity::Notice, message);
    }

    pub fn warning(&self, message: impl Display) {
        self.write(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Display) {
        self.write(Severity::Error, message);
    }

    pub fn fatal(&self, message: impl Display) {
        self.write(Severity::Fatal, message);
    }

    /// Writes a horizontal rule made of `ch`, to visually separate blocks of output.
    pub fn separator(&self, ch: char) {
        let line: String = std::iter::repeat(ch).take(SEPARATOR_WIDTH).collect();
        self.notice(line);
    }

    /// Returns a [Log] that records every entry in memory, along with a handle to read them.
    ///
    /// Entries are formatted without timestamps. Public so that integration tests can use it.
    #[doc(hidden)]
    pub fn capture() -> (Self, Captured) {
        let captured = Captured::default();
        let buffer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(LevelFilter::TRACE).with(
            tracing_fmt::layer()
                .event_format(LineFormat { timestamps: false })
                .with_writer(move || buffer.clone()),
        );
        (Log::from_dispatch(Dispatch::new(subscriber)), captured)
    }
}

/// Keeps the background file writer alive. Dropping it flushes any buffered entries, so hold on
/// to it until the program is about to exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Creates the log directory if necessary, opens the rotating log file, and returns a [Log] that
/// writes to both the file and standard output.
///
/// `verbosity` raises the level from `info` (0) to `debug` (1) and `trace` (2 or more). A
/// `RUST_LOG` environment variable overrides it.
pub fn init(settings: &LogSettings, verbosity: u8) -> anyhow::Result<(Log, LogGuard)> {
    ensure_directory(&settings.directory)?;

    let path = settings.directory.join(LOG_FILE);
    let file = RotatingFile::open(&path, settings.max_bytes, settings.backups)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_fmt::layer()
                .event_format(LineFormat { timestamps: true })
                .with_writer(io::stdout),
        )
        .with(
            tracing_fmt::layer()
                .event_format(LineFormat { timestamps: true })
                .with_writer(file_writer),
        );

    let log = Log::from_dispatch(Dispatch::new(subscriber));
    Ok((log, LogGuard { _file: guard }))
}

/// Makes sure `directory` exists and is a directory, creating it recursively if there's nothing
/// at that path.
fn ensure_directory(directory: &Path) -> anyhow::Result<()> {
    match fs::metadata(directory) {
        Ok(md) if !md.is_dir() => Err(anyhow!("not a directory: {}", directory.display())),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => fs::create_dir_all(directory)
            .with_context(|| format!("failed to create log directory {}", directory.display())),
        Err(err) => Err(err).with_context(|| format!("cannot access {}", directory.display())),
    }
}

/// Formats entries as `<timestamp> - <message>`. Anything louder or quieter than `info` gets its
/// level spelled out in front of the message, exactly once.
struct LineFormat {
    timestamps: bool,
}

impl<S, N> FormatEvent<S, N> for LineFormat
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
        if self.timestamps {
            write!(writer, "{} - ", Local::now().format(TIMESTAMP_FORMAT))?;
        }

        let metadata = event.metadata();
        let level = *metadata.level();
        if metadata.target() == FATAL_TARGET {
            write!(writer, "FATAL: ")?;
        } else if level != Level::INFO {
            write!(writer, "{level}: ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// In-memory log output produced by [Log::capture].
#[doc(hidden)]
#[derive(Clone, Debug, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    /// Everything logged so far.
    pub fn contents(&self) -> String {
        let buffer = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Everything logged so far, one entry per line.
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.0.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
