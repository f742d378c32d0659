use super::{LogError, LogValue, StatsLogger};
use crate::utils::stats::OnlineMeanVariance;
use coarsetime::{Duration as CDuration, Instant as CInstant};
use std::collections::{btree_map::Entry, BTreeMap};
use std::time::{Duration, Instant};

/// Write out summaries to a backend.
pub trait SummaryWriter {
    fn write_summaries<'a, I>(&mut self, summaries: I, elapsed: Duration)
    where
        I: Iterator<Item = (&'static str, &'a ChunkSummary)>;
}

/// Chunk summaries at fixed time intervals.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ByTime {
    // Checked on every group; the coarse clock is cheap and ~1ms accuracy is plenty here.
    pub chunk_duration: CDuration,
    coarse_chunk_start: CInstant,
}

impl ByTime {
    pub fn new(chunk_duration: Duration) -> Self {
        Self {
            chunk_duration: CDuration::new(chunk_duration.as_secs(), chunk_duration.subsec_nanos()),
            coarse_chunk_start: CInstant::now(),
        }
    }

    fn elapsed(&self) -> bool {
        self.coarse_chunk_start.elapsed() > self.chunk_duration
    }

    fn note_flush(&mut self) {
        self.coarse_chunk_start = CInstant::now();
    }
}

impl Default for ByTime {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Summary of the values logged under one name during a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkSummary {
    Scalar { stats: OnlineMeanVariance<f64> },
    Duration { stats: OnlineMeanVariance<f64> },
    Counter { increment: u64, initial_value: u64 },
}

impl ChunkSummary {
    fn new(value: LogValue) -> Self {
        match value {
            LogValue::Scalar(x) => Self::Scalar {
                stats: std::iter::once(x).collect(),
            },
            LogValue::Duration(d) => Self::Duration {
                stats: std::iter::once(d.as_secs_f64()).collect(),
            },
            LogValue::CounterIncrement(increment) => Self::Counter {
                increment,
                initial_value: 0,
            },
        }
    }

    const fn expected(&self) -> &'static str {
        match self {
            Self::Scalar { .. } => "scalar",
            Self::Duration { .. } => "duration",
            Self::Counter { .. } => "counter",
        }
    }

    fn push(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        match (self, value) {
            (Self::Scalar { stats }, LogValue::Scalar(x)) => stats.push(x),
            (Self::Duration { stats }, LogValue::Duration(d)) => stats.push(d.as_secs_f64()),
            (Self::Counter { increment, .. }, LogValue::CounterIncrement(i)) => *increment += i,
            (summary, value) => {
                return Err(LogError {
                    name,
                    value,
                    expected: summary.expected(),
                })
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        match self {
            Self::Scalar { stats } | Self::Duration { stats } => *stats = OnlineMeanVariance::default(),
            Self::Counter {
                increment,
                initial_value,
            } => {
                *initial_value += *increment;
                *increment = 0;
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Scalar { stats } | Self::Duration { stats } => stats.count() == 0,
            Self::Counter { increment, .. } => *increment == 0,
        }
    }
}

/// Logs time series statistics by breaking the series into time chunks and summarizing each.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLogger<W: SummaryWriter> {
    chunker: ByTime,
    writer: W,
    // Sorted so that summaries are written in a stable order
    summaries: BTreeMap<&'static str, ChunkSummary>,
    chunk_start: Instant,
}

impl<W: SummaryWriter> ChunkLogger<W> {
    pub fn new(chunker: ByTime, writer: W) -> Self {
        Self {
            chunker,
            writer,
            summaries: BTreeMap::new(),
            chunk_start: Instant::now(),
        }
    }

    pub fn summary(&self, name: &str) -> Option<&ChunkSummary> {
        self.summaries.get(name)
    }
}

impl<W: SummaryWriter> StatsLogger for ChunkLogger<W> {
    fn group_start(&mut self) {
        // Checked before logging so that a burst of logs lands in a single chunk
        if self.chunker.elapsed() {
            self.flush();
        }
    }

    fn group_log(&mut self, name: &'static str, value: LogValue) -> Result<(), LogError> {
        match self.summaries.entry(name) {
            Entry::Vacant(e) => {
                e.insert(ChunkSummary::new(value));
                Ok(())
            }
            Entry::Occupied(e) => e.into_mut().push(name, value),
        }
    }

    fn group_end(&mut self) {}

    fn flush(&mut self) {
        self.writer.write_summaries(
            self.summaries
                .iter()
                .filter(|(_, summary)| !summary.is_empty())
                .map(|(name, summary)| (*name, summary)),
            self.chunk_start.elapsed(),
        );
        for summary in self.summaries.values_mut() {
            summary.reset();
        }
        self.chunk_start = Instant::now();
        self.chunker.note_flush();
    }
}

impl<W: SummaryWriter> Drop for ChunkLogger<W> {
    fn drop(&mut self) {
        if self.summaries.values().any(|summary| !summary.is_empty()) {
            self.flush();
        }
    }
}
