/// Host port vtable.
///
/// Everything the engine needs from its environment comes through this trait:
/// clocks, filesystem access for the module loaders, logging, and the fatal
/// path. `DefaultPort` is a plain-std implementation suitable for tests and
/// desktop hosts; embedded hosts implement `Port` themselves and hand it to
/// `ContextOptions`.

use crate::errors::FatalCode;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WRN",
            LogLevel::Debug => "DBG",
            LogLevel::Trace => "TRC",
        }
    }
}

pub trait Port {
    /// Abort on an unrecoverable error. Must not return.
    fn fatal(&self, code: FatalCode) -> ! {
        panic!("jjs fatal: {}", code);
    }

    /// Wall clock in milliseconds since the Unix epoch.
    fn time_now_ms(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Local timezone adjustment at the given instant, in milliseconds.
    fn time_local_tza(&self, _unix_ms: f64) -> i32 {
        0
    }

    /// Monotonic clock in nanoseconds.
    fn time_hrtime(&self) -> u64 {
        use std::time::Instant;
        use once_cell::sync::Lazy;
        static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
        EPOCH.elapsed().as_nanos() as u64
    }

    /// Block the current thread.
    fn time_sleep(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }

    /// Write one log line.
    fn io_log(&self, level: LogLevel, msg: &str) {
        let _ = writeln!(std::io::stderr(), "[{}] {}", level.tag(), msg);
    }

    /// Flush buffered output.
    fn io_flush(&self) {
        let _ = std::io::stderr().flush();
        let _ = std::io::stdout().flush();
    }

    /// Load a file for the module loaders or snapshot execution.
    fn fs_read_file(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(path).ok()
    }

    /// Canonicalize a path.
    fn path_realpath(&self, path: &str) -> Option<String> {
        std::fs::canonicalize(path)
            .ok()
            .and_then(|p| p.into_os_string().into_string().ok())
    }

    /// Current working directory.
    fn cwd(&self) -> Option<String> {
        std::env::current_dir()
            .ok()
            .and_then(|p| p.into_os_string().into_string().ok())
    }
}

/// Plain-std port used when the embedder supplies nothing.
#[derive(Debug, Default)]
pub struct DefaultPort;

impl Port for DefaultPort {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A port that records log lines instead of writing them, in the spirit
    /// of a mock platform.
    struct RecordingPort {
        lines: RefCell<Vec<(LogLevel, String)>>,
    }

    impl Port for RecordingPort {
        fn io_log(&self, level: LogLevel, msg: &str) {
            self.lines.borrow_mut().push((level, msg.to_string()));
        }
    }

    #[test]
    fn recording_port_captures_lines() {
        let port = RecordingPort {
            lines: RefCell::new(Vec::new()),
        };
        port.io_log(LogLevel::Warning, "low heap");
        let lines = port.lines.borrow();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Warning);
        assert_eq!(lines[0].1, "low heap");
    }

    #[test]
    fn hrtime_is_monotonic() {
        let port = DefaultPort;
        let a = port.time_hrtime();
        let b = port.time_hrtime();
        assert!(b >= a);
    }
}
