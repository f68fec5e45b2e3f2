//! Server-log backend for the `log` facade
//!
//! Forwards engine and plugin records to the host's `logprintf`, the only
//! output channel a server plugin has. The level comes from the `AMXJIT_LOG`
//! environment variable and defaults to `info`.

use std::ffi::CString;
use std::os::raw::c_char;

use log::{LevelFilter, Log, Metadata, Record};

/// The host's printf-style log sink.
pub type Logprintf = unsafe extern "C" fn(format: *const c_char, ...);

struct HostLogger {
    logprintf: Logprintf,
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[amxjit] {}: {}", record.level(), record.args());
        if let Ok(line) = CString::new(line) {
            unsafe {
                (self.logprintf)(c"%s".as_ptr(), line.as_ptr());
            }
        }
    }

    fn flush(&self) {}
}

/// Level selected by `AMXJIT_LOG`, defaulting to `info`.
pub fn level_from_env() -> LevelFilter {
    match std::env::var("AMXJIT_LOG").as_deref() {
        Ok("off") => LevelFilter::Off,
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the `logprintf`-backed logger. Safe to call once per process;
/// later calls are ignored (the facade rejects a second logger).
pub fn init(logprintf: Logprintf) {
    let logger = Box::new(HostLogger { logprintf });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level_from_env());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the env var is not raced by the parallel test runner.
    #[test]
    fn test_level_selection() {
        std::env::remove_var("AMXJIT_LOG");
        assert_eq!(level_from_env(), LevelFilter::Info);
        std::env::set_var("AMXJIT_LOG", "trace");
        assert_eq!(level_from_env(), LevelFilter::Trace);
        std::env::set_var("AMXJIT_LOG", "off");
        assert_eq!(level_from_env(), LevelFilter::Off);
        std::env::set_var("AMXJIT_LOG", "bogus");
        assert_eq!(level_from_env(), LevelFilter::Info);
        std::env::remove_var("AMXJIT_LOG");
    }
}
