//! Leveled log sink.
//!
//! Threshold-gated, process-wide, with optional file fan-out and a
//! stack-dump-then-exit path for `Exit`/`Fatal` records. The textual record
//! format is a fixed wire contract (one line per record, parseable by
//! whatever scrapes the log file), so this sink owns its own writer instead
//! of going through `tracing_subscriber`'s default formatter. Every call
//! site still emits a matching `tracing` event with structured fields, so
//! an embedder's own `tracing` subscriber (if one is installed) sees spans
//! and fields the normal way.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level. Lower is more severe. `Verbose` covers `3` and up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level(pub i32);

impl Level {
    pub const FATAL: Level = Level(-2);
    pub const EXIT: Level = Level(-1);
    pub const ERROR: Level = Level(0);
    pub const WARNING: Level = Level(1);
    pub const INFO: Level = Level(2);
    pub const VERBOSE: Level = Level(3);

    /// `Verbose` covers any level `>= 3`; used for very-verbose levels like
    /// the stack-dump-on-`SIGUSR1` record, which the signal controller logs
    /// one notch more verbose than `Verbose` itself.
    pub fn verbose(n: i32) -> Level {
        Level(n.max(3))
    }

    fn letter(self) -> char {
        if self <= Level::ERROR {
            'E'
        } else if self == Level::WARNING {
            'W'
        } else if self == Level::INFO {
            'I'
        } else {
            'V'
        }
    }

    fn terminates(self) -> bool {
        self == Level::EXIT || self == Level::FATAL
    }

    fn dumps_stack(self) -> bool {
        self <= Level::FATAL
    }

    fn flushes(self) -> bool {
        self < Level::INFO
    }
}

/// What happens after a `Fatal`/`Exit` record is written. Production code
/// exits the process; tests substitute a recording stand-in so the exit
/// path is still exercised without tearing down the test binary.
pub trait ExitAction: Send + Sync {
    fn exit(&self, code: i32) -> !;
}

pub struct ProcessExit;

impl ExitAction for ProcessExit {
    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

struct Writers {
    file: Option<std::fs::File>,
}

/// The process-wide leveled log sink.
pub struct Sink {
    threshold: AtomicI32,
    writers: Mutex<Writers>,
    exit: Box<dyn ExitAction>,
    pid_tag: String,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("threshold", &self.threshold.load(Ordering::Relaxed))
            .field("pid_tag", &self.pid_tag)
            .finish()
    }
}

impl Sink {
    pub fn new() -> Sink {
        Sink::with_exit_action(Box::new(ProcessExit))
    }

    pub fn with_exit_action(exit: Box<dyn ExitAction>) -> Sink {
        Sink {
            threshold: AtomicI32::new(Level::INFO.0),
            writers: Mutex::new(Writers { file: None }),
            exit,
            pid_tag: format!("[{}]", std::process::id()),
        }
    }

    pub fn set_threshold(&self, level: Level) {
        self.threshold.store(level.0, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> Level {
        Level(self.threshold.load(Ordering::Relaxed))
    }

    /// Open `path` for append (create if absent) with the given permission
    /// bits, and tee every subsequent record to it as well as stderr.
    /// Returns the opened file so the caller may close it at shutdown.
    pub fn set_file(&self, path: &Path, mode: u32) -> std::io::Result<std::fs::File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(mode)
            .open(path)?;
        let handle = file.try_clone()?;
        self.writers.lock().unwrap().file = Some(file);
        redirect_stdout_to(&handle);
        Ok(handle)
    }

    /// Format and write one record if `level` is within the threshold.
    /// `file`/`line` identify the caller (pass `file!()`/`line!()`).
    pub fn printf(&self, level: Level, file: &str, line: u32, args: std::fmt::Arguments<'_>) {
        if level.0 > self.threshold.load(Ordering::Relaxed) {
            return;
        }

        let ts = format_timestamp(SystemTime::now());
        let mut line_out = format!(
            "{} {} {}:{}: {}: {}",
            self.pid_tag,
            ts,
            file,
            line,
            level.letter(),
            args
        );

        if level.dumps_stack() {
            line_out.push('\n');
            line_out.push_str(&dump_stack());
        }

        self.write_line(&line_out, level.flushes());
        emit_tracing_event(level, &line_out);

        if level.terminates() {
            self.exit.exit(1);
        }
    }

    fn write_line(&self, line: &str, flush: bool) {
        let mut writers = self.writers.lock().unwrap();
        eprintln!("{line}");
        if let Some(f) = writers.file.as_mut() {
            let _ = writeln!(f, "{line}");
            if flush {
                let _ = f.flush();
            }
        }
    }

    /// Invoke the configured exit action directly, bypassing the
    /// level-gated record path `printf` uses for `Fatal`/`Exit`. Lifecycle
    /// success paths call this so a test-installed `RecordingExit` sees
    /// every process-ending call, not just the `Fatal` ones.
    pub fn exit(&self, code: i32) -> ! {
        self.exit.exit(code)
    }

    /// Textual dump of all live tasks, doubling the buffer up to 10 times.
    /// Tokio does not expose per-task backtraces the way a Go runtime
    /// exposes goroutine stacks, so this degrades to the current thread's
    /// backtrace plus a listing of named tasks the caller supplies via
    /// `tracing`'s span registry; callers that want more detail should run
    /// under `tokio-console` and note that in the record itself.
    pub fn stack(&self) -> String {
        dump_stack()
    }
}

impl Default for Sink {
    fn default() -> Sink {
        Sink::new()
    }
}

/// Install the ambient `tracing` subscriber: `fmt` output filtered by
/// `RUST_LOG` (defaulting to `info` when unset). This is separate from
/// `Sink`'s own fixed-format records; it exists so an embedder's other
/// `tracing` spans/events (and the ones `Sink::printf` emits alongside its
/// own line) land somewhere by default instead of being silently dropped.
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
}

fn dump_stack() -> String {
    let mut attempt_len = 8 * 1024;
    for _ in 0..10 {
        let bt = std::backtrace::Backtrace::force_capture().to_string();
        if bt.len() < attempt_len {
            return bt;
        }
        attempt_len *= 2;
    }
    let bt = std::backtrace::Backtrace::force_capture().to_string();
    let mut truncated: String = bt.chars().take(attempt_len).collect();
    truncated.push_str("...");
    truncated
}

fn emit_tracing_event(level: Level, line: &str) {
    if level <= Level::ERROR {
        tracing::error!(target: "graceful::log", "{line}");
    } else if level == Level::WARNING {
        tracing::warn!(target: "graceful::log", "{line}");
    } else if level == Level::INFO {
        tracing::info!(target: "graceful::log", "{line}");
    } else {
        tracing::trace!(target: "graceful::log", "{line}");
    }
}

/// Redirect the process's stdout fd to `file` (platform-specific, Unix
/// only). Best-effort: a failure here is logged but not fatal, matching
/// the redirect being optional and platform-specific.
fn redirect_stdout_to(file: &std::fs::File) {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    if nix::unistd::dup2(fd, libc::STDOUT_FILENO).is_err() {
        tracing::warn!("failed to redirect stdout to log file");
    }
}

/// `YYYY/MM/DD HH:MM:SS.microseconds`, matching the fixed log record
/// format. Implemented with the days-from-civil algorithm (Howard Hinnant)
/// rather than pulling in a datetime crate this workspace doesn't already use.
fn format_timestamp(t: SystemTime) -> String {
    let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let micros = dur.subsec_micros();

    let days = secs.div_euclid(86_400);
    let secs_of_day = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    let hh = secs_of_day / 3600;
    let mm = (secs_of_day % 3600) / 60;
    let ss = secs_of_day % 60;

    format!("{y:04}/{m:02}/{d:02} {hh:02}:{mm:02}:{ss:02}.{micros:06}")
}

/// Civil (year, month, day) from a day count since the Unix epoch.
/// http://howardhinnant.github.io/date_algorithms.html#civil_from_days
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Logs a record at `level` through `sink`, tagging the call site.
#[macro_export]
macro_rules! printf {
    ($sink:expr, $level:expr, $($arg:tt)*) => {
        $sink.printf($level, file!(), line!(), format_args!($($arg)*))
    };
}

/// A `RecordingExit` that panics in place of actually exiting, so a
/// lifecycle/signal test can assert a process-ending call happened (and
/// with what code) without tearing down the test binary. Shared outside
/// this module's own tests so `lifecycle`'s and `signal`'s test modules
/// can install it too.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct RecordingExit(pub Mutex<Option<i32>>);

    impl RecordingExit {
        pub fn new() -> RecordingExit {
            RecordingExit(Mutex::new(None))
        }
    }

    impl ExitAction for RecordingExit {
        fn exit(&self, code: i32) -> ! {
            *self.0.lock().unwrap() = Some(code);
            panic!("would exit with code {code}");
        }
    }
}
