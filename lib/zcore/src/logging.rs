use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

pub use slog::{debug, error, info, o, trace, warn, Discard, Level, Logger};

/// Builds the root logger from a sloggers TOML config. Callers hand child
/// loggers of this to every component they construct.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Builtin logger config must parse");

    config.build_logger().expect("Logger construction failed")
}

/// Returns a logger that swallows everything. Used where a component is
/// constructed without an injected logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Frame trace verbosity. `Off` silences the frame trace entirely; the
/// levels above it progressively add frame dumps, retry detail and nonce
/// lifecycle events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TraceLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl TraceLevel {
    fn from_raw(raw: u8) -> TraceLevel {
        match raw {
            1 => TraceLevel::Low,
            2 => TraceLevel::Medium,
            3 => TraceLevel::High,
            _ => TraceLevel::Off,
        }
    }
}

/// A level gated frame trace. Wraps an injected logger with a runtime
/// adjustable verbosity so the driver can turn frame tracing on and off
/// without touching the logger tree. Cloning shares the gate.
#[derive(Clone)]
pub struct Trace {
    log: Logger,
    level: Arc<AtomicU8>,
    generation: Arc<AtomicU32>,
}

impl Trace {
    pub fn new(log: Logger, level: TraceLevel) -> Trace {
        Trace {
            log,
            level: Arc::new(AtomicU8::new(level as u8)),
            generation: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The underlying logger, for emissions that are not level gated.
    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn level(&self) -> TraceLevel {
        TraceLevel::from_raw(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: TraceLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn low(&self) -> bool {
        self.level() >= TraceLevel::Low
    }

    #[inline]
    pub fn medium(&self) -> bool {
        self.level() >= TraceLevel::Medium
    }

    #[inline]
    pub fn high(&self) -> bool {
        self.level() >= TraceLevel::High
    }

    /// Emits a flush marker so the sink can be synced against the live
    /// stream. The terminal and file sinks write line buffered, so the
    /// marker itself is the barrier.
    pub fn flush(&self) {
        info!(self.log, "trace flush"; "generation" => self.generation.load(Ordering::Relaxed));
    }

    /// Starts a new trace generation. Every line logged afterwards carries
    /// the bumped generation, which is what "resetting" the trace means for
    /// a line oriented sink.
    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(self.log, "trace reset"; "generation" => generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gates() {
        let trace = Trace::new(discard(), TraceLevel::Medium);

        assert!(trace.low());
        assert!(trace.medium());
        assert!(!trace.high());

        trace.set_level(TraceLevel::Off);
        assert!(!trace.low());

        trace.set_level(TraceLevel::High);
        assert!(trace.high());
    }

    #[test]
    fn test_gate_is_shared_across_clones() {
        let trace = Trace::new(discard(), TraceLevel::Off);
        let clone = trace.clone();

        clone.set_level(TraceLevel::Low);
        assert!(trace.low());
    }
}
