//! Command-line logger
use super::chunk::{ByTime, ChunkLogger, ChunkSummary, SummaryWriter};
use super::{LogError, LogValue, StatsLogger};
use std::fmt;
use std::time::Duration;
use yansi::Paint;

/// Logger that displays time-chunked summaries on standard output.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayLogger(ChunkLogger<DisplayBackend>);

impl DisplayLogger {
    #[inline]
    pub fn new(chunker: ByTime) -> Self {
        Self(ChunkLogger::new(chunker, DisplayBackend))
    }
}

impl Default for DisplayLogger {
    fn default() -> Self {
        Self::new(ByTime::default())
    }
}

impl StatsLogger for DisplayLogger {
    #[inline]
    fn group_start(&mut self) {
        self.0.group_start()
    }
    #[inline]
    fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        self.0.group_log(name, value)
    }
    #[inline]
    fn group_end(&mut self) {
        self.0.group_end()
    }
    #[inline]
    fn flush(&mut self) {
        self.0.flush()
    }
}

/// Logging backend that displays summaries on standard output.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DisplayBackend;

impl SummaryWriter for DisplayBackend {
    fn write_summaries<'a, I>(&mut self, summaries: I, elapsed: Duration)
    where
        I: Iterator<Item = (&'static str, &'a ChunkSummary)>,
    {
        println!();
        for (name, summary) in summaries {
            println!(
                "{:<24} {}",
                Paint::fixed(35, name),
                DisplaySummary {
                    summary,
                    elapsed: &elapsed
                }
            );
        }
    }
}

#[derive(Debug)]
struct DisplaySummary<'a> {
    summary: &'a ChunkSummary,
    elapsed: &'a Duration,
}

impl<'a> fmt::Display for DisplaySummary<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.summary {
            ChunkSummary::Counter {
                increment,
                initial_value,
            } => write!(
                f,
                "{}  (+{})",
                initial_value + increment,
                Paint::fixed(253, increment)
            ),
            ChunkSummary::Duration { stats } => {
                if let Some(mean) = stats.mean() {
                    write!(f, "{:.4?}", Duration::from_secs_f64(mean))?;
                    if let (true, Some(stddev)) = (stats.count() > 1, stats.stddev()) {
                        let stddev = format!("(σ {:.4?})", Duration::from_secs_f64(stddev));
                        write!(f, " {}", Paint::fixed(8, stddev))?;
                    }
                    let share = format!("{:.2}%", mean / self.elapsed.as_secs_f64() * 100.0);
                    write!(f, " {}", Paint::fixed(221, share))?;
                }
                Ok(())
            }
            ChunkSummary::Scalar { stats } => {
                if let Some(mean) = stats.mean() {
                    write!(f, "{:.3}", mean)?;
                    if let (true, Some(stddev)) = (stats.count() > 1, stats.stddev()) {
                        write!(f, " {}", Paint::fixed(8, format!("(σ {:.3})", stddev)))?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::stats::OnlineMeanVariance;

    #[test]
    fn display_scalar_summary() {
        Paint::disable();
        let summary = ChunkSummary::Scalar {
            stats: [1.0, 3.0].into_iter().collect::<OnlineMeanVariance<f64>>(),
        };
        let elapsed = Duration::from_secs(1);
        let text = DisplaySummary {
            summary: &summary,
            elapsed: &elapsed,
        }
        .to_string();
        assert_eq!(text, "2.000 (σ 1.000)");
    }

    #[test]
    fn display_counter_summary() {
        Paint::disable();
        let summary = ChunkSummary::Counter {
            increment: 3,
            initial_value: 4,
        };
        let elapsed = Duration::from_secs(1);
        let text = DisplaySummary {
            summary: &summary,
            elapsed: &elapsed,
        }
        .to_string();
        assert_eq!(text, "7  (+3)");
    }
}
