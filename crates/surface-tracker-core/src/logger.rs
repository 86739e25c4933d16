//! Stderr logger tagged with elapsed time and thread name.
//!
//! Lines look like `[  1.204s DEBUG surface-cache-filler] message`, which
//! keeps playback-thread and fill-thread messages apart. Install it with
//! `init_with_level`; only the first call has an effect.

use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

struct ThreadTaggedLogger {
    max_level: LevelFilter,
    epoch: Instant,
}

impl Log for ThreadTaggedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let current = std::thread::current();
        let thread = current.name().unwrap_or("unnamed");
        let line = format!(
            "[{:8.3}s {:>5} {thread}] {}\n",
            self.epoch.elapsed().as_secs_f64(),
            record.level(),
            record.args()
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static INSTALLED: OnceLock<ThreadTaggedLogger> = OnceLock::new();

/// Install the logger at `level`.
///
/// Fails only if a different logger was installed elsewhere first.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut first = false;
    let logger = INSTALLED.get_or_init(|| {
        first = true;
        ThreadTaggedLogger {
            max_level: level,
            epoch: Instant::now(),
        }
    });
    if first {
        log::set_logger(logger)?;
        log::set_max_level(level);
    }
    Ok(())
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Spans report their duration on close. Calling it again is a no-op.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder.compact().finish().try_init()
    };
}
