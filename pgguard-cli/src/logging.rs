//! One global logger, installed once at process-entry dispatch, before any
//! personality executes (§10, AMBIENT STACK). Every line carries a
//! timestamp and this process's PID, satisfying §7's "all errors are
//! logged to stdout with timestamp + PID prefix" as a logger format rather
//! than something every call site hand-formats.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StdoutLogger {
    colors: bool,
}

impl Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let level = color(self.colors, record.level());
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(
            stdout,
            "{:>10}.{:03} [{}] pid={} {}: {}",
            now.as_secs(),
            now.subsec_millis(),
            level,
            std::process::id(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

fn color(colors: bool, level: Level) -> &'static str {
    if !colors {
        return level.as_str();
    }
    match level {
        Level::Error => "\x1b[31mERROR\x1b[0m",
        Level::Warn => "\x1b[33mWARN\x1b[0m",
        Level::Info => "\x1b[32mINFO\x1b[0m",
        Level::Debug => "\x1b[36mDEBUG\x1b[0m",
        Level::Trace => "\x1b[90mTRACE\x1b[0m",
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide logger, idempotently. `XPG_LOG_DEBUG` (any
/// non-empty value) raises the default level from `info` to `debug`.
pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    use std::io::IsTerminal;
    let level = match std::env::var("XPG_LOG_DEBUG") {
        Ok(value) if !value.trim().is_empty() => LevelFilter::Debug,
        _ => LevelFilter::Info,
    };
    log::set_max_level(level);
    let logger = StdoutLogger { colors: std::io::stdout().is_terminal() };
    if let Err(err) = log::set_boxed_logger(Box::new(logger)) {
        eprintln!("could not initialize logger: {err}");
    }
}
