//! Tensorboard logger
use super::chunk::{ByTime, ChunkLogger, ChunkSummary, SummaryWriter};
use super::{LogError, LogValue, StatsLogger};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tensorboard_rs::summary_writer::SummaryWriter as TbSummaryWriter;

/// Logger that saves time-chunked summaries to a tensorboard event file.
#[derive(Debug)]
pub struct TensorBoardLogger(ChunkLogger<TensorBoardBackend>);

impl TensorBoardLogger {
    #[inline]
    pub fn new<P: AsRef<Path>>(chunker: ByTime, log_dir: P) -> Self {
        Self(ChunkLogger::new(chunker, TensorBoardBackend::new(log_dir)))
    }
}

impl StatsLogger for TensorBoardLogger {
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

/// Logging backend that saves summaries to a tensorboard event file.
pub struct TensorBoardBackend {
    writer: TbSummaryWriter,
    summary_index: usize,
}

impl fmt::Debug for TensorBoardBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TensorBoardBackend")
            .field("summary_index", &self.summary_index)
            .finish()
    }
}

impl TensorBoardBackend {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            writer: TbSummaryWriter::new(log_dir),
            summary_index: 0,
        }
    }
}

impl SummaryWriter for TensorBoardBackend {
    #[allow(clippy::cast_possible_truncation)]
    fn write_summaries<'a, I>(&mut self, summaries: I, _: Duration)
    where
        I: Iterator<Item = (&'static str, &'a ChunkSummary)>,
    {
        for (tag, summary) in summaries {
            let value = match summary {
                ChunkSummary::Counter {
                    increment,
                    initial_value,
                } => Some((initial_value + increment) as f32),
                ChunkSummary::Duration { stats } | ChunkSummary::Scalar { stats } => {
                    stats.mean().map(|mean| mean as f32)
                }
            };
            if let Some(value) = value {
                self.writer.add_scalar(tag, value, self.summary_index);
            }
        }
        self.summary_index += 1;
        self.writer.flush();
    }
}
