//! Logging training statistics
mod chunk;
mod display;
mod tensorboard;

pub use chunk::{ByTime, ChunkLogger, ChunkSummary, SummaryWriter};
pub use display::{DisplayBackend, DisplayLogger};
pub use tensorboard::{TensorBoardBackend, TensorBoardLogger};

use std::time::{Duration, Instant};
use thiserror::Error;

/// A value that can be logged.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LogValue {
    /// A scalar value. Aggregate by taking means.
    Scalar(f64),
    /// A duration. Aggregate by taking means.
    Duration(Duration),
    /// Increment to a monotonic counter.
    CounterIncrement(u64),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("\"{name}\": incompatible value {value:?}, expected {expected}")]
pub struct LogError {
    pub name: &'static str,
    pub value: LogValue,
    pub expected: &'static str,
}

/// Log statistics from training runs.
///
/// Values are grouped: a group starts with [`StatsLogger::group_start`] and ends with
/// [`StatsLogger::group_end`]. Backends only flush between groups.
pub trait StatsLogger {
    /// Start a new group of logs.
    fn group_start(&mut self);

    /// Log a value within the current group.
    ///
    /// # Returns
    /// An error if the value is structurally incompatible with previous values
    /// logged under the same name.
    fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError>;

    /// End the current group.
    fn group_end(&mut self);

    /// Write all pending summaries.
    fn flush(&mut self);

    /// Log a single value as its own group.
    fn log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        self.group_start();
        let result = self.group_log(name, value);
        self.group_end();
        result
    }

    fn log_scalar(&mut self, name: &'static str, value: f64) {
        self.log(name, LogValue::Scalar(value))
            .unwrap_or_else(|err| log::warn!("{}", err))
    }

    fn log_duration(&mut self, name: &'static str, duration: Duration) {
        self.log(name, LogValue::Duration(duration))
            .unwrap_or_else(|err| log::warn!("{}", err))
    }

    fn log_counter_increment(&mut self, name: &'static str, increment: u64) {
        self.log(name, LogValue::CounterIncrement(increment))
            .unwrap_or_else(|err| log::warn!("{}", err))
    }

    /// Evaluate `f` and log how long it took.
    fn log_elapsed<F, T>(&mut self, name: &'static str, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
        Self: Sized,
    {
        let start = Instant::now();
        let result = f(self);
        self.log_duration(name, start.elapsed());
        result
    }
}

/// Logger that does nothing
impl StatsLogger for () {
    fn group_start(&mut self) {}
    fn group_log(&mut self, _: &'static str, _: LogValue) -> Result<(), LogError> {
        Ok(())
    }
    fn group_end(&mut self) {}
    fn flush(&mut self) {}
}

/// Forward logs to both loggers.
impl<A: StatsLogger, B: StatsLogger> StatsLogger for (A, B) {
    fn group_start(&mut self) {
        self.0.group_start();
        self.1.group_start();
    }
    fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        let first = self.0.group_log(name, value);
        let second = self.1.group_log(name, value);
        first.and(second)
    }
    fn group_end(&mut self) {
        self.0.group_end();
        self.1.group_end();
    }
    fn flush(&mut self) {
        self.0.flush();
        self.1.flush();
    }
}

impl<L: StatsLogger + ?Sized> StatsLogger for Box<L> {
    fn group_start(&mut self) {
        L::group_start(self)
    }
    fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        L::group_log(self, name, value)
    }
    fn group_end(&mut self) {
        L::group_end(self)
    }
    fn flush(&mut self) {
        L::flush(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        groups: usize,
        values: Vec<(&'static str, LogValue)>,
    }

    impl StatsLogger for Recorder {
        fn group_start(&mut self) {
            self.groups += 1;
        }
        fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
            self.values.push((name, value));
            Ok(())
        }
        fn group_end(&mut self) {}
        fn flush(&mut self) {}
    }

    #[test]
    fn pair_forwards_to_both() {
        let mut logger = (Recorder::default(), Recorder::default());
        logger.log_scalar("loss", 1.5);
        logger.log_counter_increment("iter", 1);
        assert_eq!(logger.0.values, logger.1.values);
        assert_eq!(logger.0.groups, 2);
    }

    #[test]
    fn log_elapsed_returns_result() {
        let mut logger = Recorder::default();
        let value = logger.log_elapsed("update", |_| 3);
        assert_eq!(value, 3);
        assert!(matches!(logger.values[0], ("update", LogValue::Duration(_))));
    }
}
