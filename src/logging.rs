//! Logging infrastructure for structured console and file output.
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

use regex::Regex;

/// Abstraction over logging backends.
///
/// Components receive the logger as an injected `Arc<dyn Log>` capability so
/// that the staging pipeline and the supervisor never own a concrete logger.
pub trait Log: Send + Sync + std::fmt::Debug {
    /// Log a stage header (major section).
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (may be suppressed on console).
    fn debug(&self, msg: &str);
    /// Log a warning message.
    fn warn(&self, msg: &str);
    /// Log an error message.
    fn error(&self, msg: &str);
    /// Whether debug output is enabled.
    ///
    /// Buildpack steps echo their full output and init scripts receive a
    /// `--debug` argument only when this returns `true`.
    fn verbose(&self) -> bool {
        false
    }
}

/// ANSI CSI sequences plus C1 control openers, as produced by
/// colour-enabled buildpack scripts.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a literal, verified by tests
    let pattern = Regex::new(r"(?:\x1B[@-_]|[\u{80}-\u{9F}])[0-?]*[ -/]*[@-~]").unwrap();
    pattern
});

/// Strip ANSI escape sequences from a string.
///
/// Handles SGR and other CSI sequences as well as raw C1 control openers,
/// so cursor movement, erase, etc. are stripped without consuming
/// unrelated text.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").into_owned()
}

/// Structured logger with console and persistent file output.
///
/// All messages are always written to a log file at
/// `$XDG_CACHE_HOME/droplet/<command>.log` (default
/// `~/.cache/droplet/<command>.log`) with timestamps and ANSI codes
/// stripped, regardless of the verbose flag.
#[derive(Debug)]
pub struct Logger {
    log_file: Option<PathBuf>,
    verbose: bool,
}

impl Logger {
    /// Create a new logger.
    ///
    /// Stores the log file path for later inspection. The file itself is
    /// created and written by [`init_subscriber`] via [`FileLayer`].
    #[must_use]
    pub fn new(command: &str, verbose: bool) -> Self {
        Self {
            log_file: log_file_path(command),
            verbose,
        }
    }

    /// Return the log file path, if available.
    #[must_use]
    pub const fn log_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    /// Log an error message.
    pub fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    /// Log a warning message.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    /// Log a stage header (major section).
    pub fn stage(&self, msg: &str) {
        tracing::info!(target: "droplet::stage", "{msg}");
    }

    /// Log an informational message.
    pub fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    /// Log a debug message (suppressed on console unless verbose; always
    /// written to the log file via the [`FileLayer`]).
    pub fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }
}

impl Log for Logger {
    fn stage(&self, msg: &str) {
        self.stage(msg);
    }

    fn info(&self, msg: &str) {
        self.info(msg);
    }

    fn debug(&self, msg: &str) {
        self.debug(msg);
    }

    fn warn(&self, msg: &str) {
        self.warn(msg);
    }

    fn error(&self, msg: &str) {
        self.error(msg);
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Return the `$XDG_CACHE_HOME/droplet/` directory, creating it if needed.
fn cache_dir() -> Option<PathBuf> {
    let cache_dir = std::env::var("XDG_CACHE_HOME").map_or_else(
        |_| {
            std::env::var("HOME")
                .map_or_else(|_| PathBuf::from("."), PathBuf::from)
                .join(".cache")
        },
        PathBuf::from,
    );
    let dir = cache_dir.join("droplet");
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Return the log file path under `$XDG_CACHE_HOME/droplet/`.
fn log_file_path(command: &str) -> Option<PathBuf> {
    Some(cache_dir()?.join(format!("{command}.log")))
}

/// Month lengths of a non-leap year, January first.
const MONTH_LENGTHS: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

const fn leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

const fn year_length(year: u64) -> u64 {
    if leap_year(year) { 366 } else { 365 }
}

/// Calendar fields of one UTC instant.
#[derive(Debug, Clone, Copy)]
struct UtcTime {
    year: u64,
    month: u64,
    day: u64,
    hour: u64,
    minute: u64,
    second: u64,
}

impl UtcTime {
    /// Break seconds since the Unix epoch into calendar fields by walking
    /// whole years, then months, forward from 1970. Timestamps stay within
    /// a few decades of the epoch, so the walk is short.
    fn from_epoch_secs(secs: u64) -> Self {
        let mut days = secs / 86_400;
        let clock = secs % 86_400;
        let mut year = 1970;
        while days >= year_length(year) {
            days -= year_length(year);
            year += 1;
        }
        let mut month = 12;
        for (offset, base) in MONTH_LENGTHS.iter().enumerate() {
            let length = base + u64::from(offset == 1 && leap_year(year));
            if days < length {
                month = offset as u64 + 1;
                break;
            }
            days -= length;
        }
        Self {
            year,
            month,
            day: days + 1,
            hour: clock / 3600,
            minute: clock % 3600 / 60,
            second: clock % 60,
        }
    }

    /// The current instant.
    fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::from_epoch_secs(secs)
    }

    /// `YYYY-MM-DD HH:MM:SS`.
    fn date_time(self) -> String {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }

    /// `HH:MM:SS`.
    fn clock(self) -> String {
        format!("{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

/// Pulls the `message` field out of a [`tracing::Event`].
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// Severity tag for a file log line; stage banners get their own tag so
/// the file mirrors the console structure.
fn file_tag(level: tracing::Level, target: &str) -> &'static str {
    if target == "droplet::stage" {
        return "stage";
    }
    match level {
        tracing::Level::ERROR => "error",
        tracing::Level::WARN => "warn",
        tracing::Level::DEBUG => "debug",
        _ => "info",
    }
}

/// Tracing layer that records the whole run, debug included, in the cache
/// directory log file. Lines are timestamped and ANSI-stripped.
#[derive(Debug)]
struct FileLayer {
    file: Mutex<fs::File>,
}

impl FileLayer {
    /// Start a fresh log file for this invocation and write its header
    /// line. Returns `None` when the cache directory is unavailable.
    fn new(command: &str) -> Option<Self> {
        let path = log_file_path(command)?;
        let file = fs::File::create(&path).ok()?;
        let layer = Self {
            file: Mutex::new(file),
        };
        let version =
            option_env!("DROPLET_VERSION").unwrap_or(concat!("dev-", env!("CARGO_PKG_VERSION")));
        layer.write_line(&format!(
            "# droplet {version} '{command}' log, opened {} UTC",
            UtcTime::now().date_time()
        ));
        Some(layer)
    }

    /// Append one line. A failed write (full disk, revoked mount) must not
    /// take the run down with it.
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            writeln!(file, "{line}").ok();
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FileLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let tag = file_tag(*event.metadata().level(), event.metadata().target());
        self.write_line(&format!(
            "{} {tag:<5} {}",
            UtcTime::now().clock(),
            strip_ansi(&visitor.message)
        ));
    }
}

/// Console rendering: cyan `::` stage banners, coloured severity prefixes,
/// indented detail lines.
struct ConsoleFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let msg = &visitor.message;

        if event.metadata().target() == "droplet::stage" {
            return writeln!(writer, "\x1b[1;36m::\x1b[0m \x1b[1m{msg}\x1b[0m");
        }
        match *event.metadata().level() {
            tracing::Level::ERROR => writeln!(writer, "\x1b[1;31merror:\x1b[0m {msg}"),
            tracing::Level::WARN => writeln!(writer, "\x1b[1;33mwarning:\x1b[0m {msg}"),
            tracing::Level::INFO => writeln!(writer, "   {msg}"),
            _ => writeln!(writer, "   \x1b[2m{msg}\x1b[0m"),
        }
    }
}

/// Install the global [`tracing`] subscriber: the droplet console format
/// plus a file layer recording the whole run (debug included) under
/// `$XDG_CACHE_HOME/droplet/<command>.log`.
///
/// Call once, before the first log line.
pub fn init_subscriber(verbose: bool, command: &str) {
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::{
        Layer as _, filter::LevelFilter, fmt, layer::SubscriberExt as _,
        util::SubscriberInitExt as _,
    };

    // Errors belong on stderr; everything else is regular program output,
    // the way the staged applications themselves write to stdout.
    let console_writer = std::io::stderr
        .with_max_level(tracing::Level::ERROR)
        .and(std::io::stdout.with_min_level(tracing::Level::WARN));

    let console = fmt::layer()
        .event_format(ConsoleFormatter)
        .with_writer(console_writer)
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        });

    // The file copy keeps debug detail even when the console does not.
    let file = FileLayer::new(command).map(|layer| layer.with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
}
