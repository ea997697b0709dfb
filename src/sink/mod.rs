//! Frame delivery
//!
//! The capture loop hands every dequeued buffer to a [`FrameSink`]. The
//! [`FramePipeline`] is the configured sink: it applies the frame-skip
//! policy, optionally logs the bitstream structure and fans accepted frames
//! out to its outputs.

pub mod file;
pub mod nal;

use tracing::{error, info, trace};

use crate::config::SinkConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::frame::{hex_preview, CapturedFrame};

pub use file::{AppendSink, SnapshotSink};
pub use nal::{nal_type_name, scan_start_codes, NalUnit};

/// What a sink did with an offered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame reached the sink's output
    Delivered,
    /// The frame was filtered out
    Skipped,
}

/// Receiver of captured frames
pub trait FrameSink {
    /// Consume one frame. The bytes are only valid during the call.
    fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery>;

    /// Short name used in logs
    fn name(&self) -> &str {
        "sink"
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery> {
        (**self).deliver(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Discards every frame
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&mut self, _frame: &CapturedFrame<'_>) -> Result<Delivery> {
        Ok(Delivery::Delivered)
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Delivers one frame out of every `interval`
#[derive(Debug, Clone)]
pub struct SkipFilter {
    interval: u32,
    count: u32,
}

impl SkipFilter {
    /// `interval` of 0 or 1 delivers every frame
    pub fn new(interval: u32) -> Self {
        Self { interval, count: 0 }
    }

    /// Count a candidate frame, returns whether it should be delivered
    pub fn accept(&mut self) -> bool {
        if self.interval <= 1 {
            return true;
        }
        self.count += 1;
        if self.count < self.interval {
            trace!("skip.   {}/{}", self.count, self.interval);
            return false;
        }
        trace!("handle. {}/{}", self.count, self.interval);
        self.count = 0;
        true
    }

    /// Frames seen since the last delivery
    pub fn pending(&self) -> u32 {
        self.count
    }
}

/// Per-pipeline delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub offered: u64,
    pub skipped: u64,
    pub delivered: u64,
    pub write_errors: u64,
}

/// Skip filter, bitstream inspection and output fan-out
pub struct FramePipeline {
    skip: SkipFilter,
    dump_level: u8,
    outputs: Vec<Box<dyn FrameSink + Send>>,
    stats: SinkStats,
    throttler: LogThrottler,
}

impl FramePipeline {
    pub fn new(skip_interval: u32, dump_level: u8) -> Self {
        Self {
            skip: SkipFilter::new(skip_interval),
            dump_level,
            outputs: Vec::new(),
            stats: SinkStats::default(),
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Build the pipeline described by the configuration
    ///
    /// Opening the append output is a setup step and fails the build.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let mut pipeline = Self::new(config.skip_interval, config.dump_level);
        if let Some(path) = &config.output {
            pipeline.add_output(AppendSink::create(path)?);
        }
        if let Some(path) = &config.snapshot {
            pipeline.add_output(SnapshotSink::new(path));
        }
        Ok(pipeline)
    }

    pub fn add_output<S: FrameSink + Send + 'static>(&mut self, sink: S) {
        self.outputs.push(Box::new(sink));
    }

    pub fn with_output<S: FrameSink + Send + 'static>(mut self, sink: S) -> Self {
        self.add_output(sink);
        self
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    fn inspect(&self, frame: &CapturedFrame<'_>) {
        for unit in scan_start_codes(frame.data) {
            if self.dump_level >= 2 {
                info!(
                    "{} - NAL type {:2} ({}) at offs {}",
                    hex_preview(&frame.data[unit.start..], 8),
                    unit.nal_type,
                    nal_type_name(unit.nal_type),
                    unit.offset
                );
            } else {
                info!("NAL type {:2} at offs {}", unit.nal_type, unit.offset);
            }
        }
    }

    fn report_failure(&mut self, sink: &str, err: &AppError) {
        self.stats.write_errors += 1;
        match self.throttler.should_log(&format!("sink_{}", sink)) {
            Some(0) => error!("{}", err),
            Some(suppressed) => error!("{} (suppressed {} repeats)", err, suppressed),
            None => {}
        }
    }
}

impl FrameSink for FramePipeline {
    /// Never fails: output errors are logged here and capture goes on
    fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery> {
        self.stats.offered += 1;
        if !self.skip.accept() {
            self.stats.skipped += 1;
            return Ok(Delivery::Skipped);
        }

        if self.dump_level > 0 {
            self.inspect(frame);
        }

        let mut failures = Vec::new();
        for output in &mut self.outputs {
            if let Err(e) = output.deliver(frame) {
                failures.push((output.name().to_string(), e));
            }
        }
        for (name, err) in failures {
            self.report_failure(&name, &err);
        }

        self.stats.delivered += 1;
        Ok(Delivery::Delivered)
    }

    fn name(&self) -> &str {
        "pipeline"
    }
}
