//! Streaming capture loop
//!
//! [`CaptureLoop`] owns an open session and its buffer pool. It starts the
//! stream, cycles buffers through dequeue, delivery and requeue while the run
//! flag is set, and always stops the stream and releases every mapping on the
//! way out.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use super::buffer_pool::BufferPool;
use super::device::{CaptureDevice, CaptureSession, V4l2Device};
use super::frame::CapturedFrame;
use super::uvc::{EncoderConfigurator, ProbeCommit};
use crate::config::{CaptureConfig, EncoderConfig};
use crate::error::{AppError, Result};
use crate::sink::{Delivery, FrameSink};
use crate::utils::LogThrottler;

/// Capture loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not streaming (before STREAMON or after a clean stop)
    Idle,
    /// STREAMON succeeded, buffers are cycling
    Streaming,
    /// A dequeue or requeue failed; absorbing
    Failed,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "idle"),
            CaptureState::Streaming => write!(f, "streaming"),
            CaptureState::Failed => write!(f, "failed"),
        }
    }
}

/// Counters of one capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Buffers dequeued from the driver
    pub frames: u64,
    /// Frames the sink delivered; skipped and failed frames are excluded
    pub delivered: u64,
    /// Frames missing according to the kernel sequence numbers
    pub dropped: u64,
    /// Sequence number of the last dequeued buffer
    pub last_sequence: Option<u32>,
}

impl CaptureStats {
    fn record_sequence(&mut self, sequence: u32) {
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                let missing = sequence.wrapping_sub(expected) as u64;
                warn!(
                    "Sequence gap: expected {}, got {} ({} frames lost)",
                    expected, sequence, missing
                );
                self.dropped += missing;
            }
        }
        self.last_sequence = Some(sequence);
    }
}

/// Stream state machine over an open session and its buffer pool
pub struct CaptureLoop<D: CaptureDevice> {
    pool: Option<BufferPool<D>>,
    session: Option<CaptureSession<D>>,
    state: CaptureState,
    stats: CaptureStats,
    sink_errors: LogThrottler,
}

impl<D: CaptureDevice> CaptureLoop<D> {
    pub fn new(session: CaptureSession<D>, pool: BufferPool<D>) -> Self {
        Self {
            pool: Some(pool),
            session: Some(session),
            state: CaptureState::Idle,
            stats: CaptureStats::default(),
            sink_errors: LogThrottler::with_secs(5),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Buffer pool, until shutdown releases it
    pub fn pool(&self) -> Option<&BufferPool<D>> {
        self.pool.as_ref()
    }

    /// Issue STREAMON
    ///
    /// On failure the loop stays `Idle`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            CaptureState::Streaming => return Ok(()),
            CaptureState::Failed => {
                return Err(AppError::StreamStartFailed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "capture loop already failed",
                )))
            }
            CaptureState::Idle => {}
        }
        let session = self.session.as_ref().ok_or_else(|| {
            AppError::StreamStartFailed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already closed",
            ))
        })?;

        session
            .device()
            .stream_on()
            .map_err(AppError::StreamStartFailed)?;
        self.state = CaptureState::Streaming;
        info!("Streaming started on {:?}", session.label());
        Ok(())
    }

    /// Cycle buffers until `running` clears, `max_frames` is reached or an
    /// ioctl fails
    ///
    /// The flag is checked once per iteration, before the next dequeue.
    /// Cleanup runs on every exit path.
    pub fn run<S>(
        &mut self,
        sink: &mut S,
        running: &AtomicBool,
        max_frames: Option<u64>,
    ) -> Result<CaptureStats>
    where
        S: FrameSink + ?Sized,
    {
        if self.state != CaptureState::Streaming {
            self.start()?;
        }

        let result = loop {
            if !running.load(Ordering::Relaxed) {
                debug!("Run flag cleared");
                break Ok(());
            }
            if max_frames.is_some_and(|max| self.stats.frames >= max) {
                debug!("Frame limit {} reached", self.stats.frames);
                break Ok(());
            }
            if let Err(e) = self.step(sink) {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            error!("Capture failed: {}", e);
            self.state = CaptureState::Failed;
        }
        self.shutdown();

        info!(
            "Capture finished: {} frames, {} delivered, {} lost",
            self.stats.frames, self.stats.delivered, self.stats.dropped
        );
        result.map(|_| self.stats)
    }

    /// One dequeue, deliver, requeue cycle
    fn step<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: FrameSink + ?Sized,
    {
        let (Some(session), Some(pool)) = (self.session.as_ref(), self.pool.as_mut()) else {
            return Err(AppError::DequeueFailed("capture already shut down".into()));
        };
        let device = session.device();

        let handle = pool.dequeue(device)?;
        self.stats.frames += 1;
        self.stats.record_sequence(handle.sequence);

        let frame = CapturedFrame::new(&handle, pool.data(&handle));
        debug!(
            "frame {}: buf {} flags {:#x} bytes {} field {} seq {} [{}]",
            self.stats.frames,
            handle.index,
            handle.flags,
            handle.bytes_used,
            handle.field,
            handle.sequence,
            frame.preview(8)
        );

        // FramePipeline logs its own output failures and never returns one.
        // Errors land here only from sinks driven without a pipeline.
        match sink.deliver(&frame) {
            Ok(Delivery::Delivered) => self.stats.delivered += 1,
            Ok(Delivery::Skipped) => {}
            Err(e) => match self.sink_errors.should_log(sink.name()) {
                Some(0) => error!("Sink {} failed: {}", sink.name(), e),
                Some(n) => error!(
                    "Sink {} failed: {} (suppressed {} repeats)",
                    sink.name(),
                    e,
                    n
                ),
                None => {}
            },
        }

        pool.requeue(device, handle.index)
    }

    /// Stop the stream, unmap every buffer and close the device
    ///
    /// STREAMOFF is issued whatever the state. Calling this again is a no-op.
    pub fn shutdown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.device().stream_off() {
            warn!("VIDIOC_STREAMOFF on {:?} failed: {}", session.label(), e);
        }
        if let Some(mut pool) = self.pool.take() {
            pool.reclaim();
            pool.release();
        }
        session.close();

        if self.state == CaptureState::Streaming {
            self.state = CaptureState::Idle;
        }
    }
}

impl<D: CaptureDevice> Drop for CaptureLoop<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the extension-unit negotiation according to `config`
///
/// Failure is returned only when the encoder is marked as required.
pub fn configure_encoder<D: CaptureDevice>(
    device: &D,
    config: &EncoderConfig,
) -> Result<Option<ProbeCommit>> {
    if !config.enabled {
        debug!("Encoder negotiation disabled");
        return Ok(None);
    }

    match EncoderConfigurator::new(device, config.unit_id).configure(config) {
        Ok(record) => Ok(Some(record)),
        Err(e) if config.required => Err(e),
        Err(e) => {
            warn!("{}; continuing without encoder configuration", e);
            Ok(None)
        }
    }
}

/// Open the configured V4L2 node and capture from it
pub fn run_capture<S>(
    config: &CaptureConfig,
    sink: &mut S,
    running: &AtomicBool,
) -> Result<CaptureStats>
where
    S: FrameSink + ?Sized,
{
    config.validate()?;
    let device = V4l2Device::open(&config.device).map_err(|e| AppError::OpenFailed {
        device: config.device.clone(),
        source: e,
    })?;
    run_capture_on(device, &config.device, config, sink, running)
}

/// Session, encoder and format negotiation plus buffer allocation
///
/// Returns a loop ready for [`CaptureLoop::start`]. Resources acquired
/// before a failing step are released before the error is returned.
pub fn prepare_capture<D: CaptureDevice>(
    device: D,
    label: impl AsRef<Path>,
    config: &CaptureConfig,
) -> Result<CaptureLoop<D>> {
    config.validate()?;
    let mut session = CaptureSession::from_device(device, label)?;

    configure_encoder(session.device(), &config.encoder)?;

    let request = config.format_request()?;
    let format = session.negotiate_format(&request)?;

    let pool = BufferPool::allocate(session.device(), config.buffer_count)?;
    info!("Capturing {} with {} buffers", format, pool.len());

    Ok(CaptureLoop::new(session, pool))
}

/// Full capture sequence on an already opened device
pub fn run_capture_on<D, S>(
    device: D,
    label: impl AsRef<Path>,
    config: &CaptureConfig,
    sink: &mut S,
    running: &AtomicBool,
) -> Result<CaptureStats>
where
    D: CaptureDevice,
    S: FrameSink + ?Sized,
{
    let mut capture = prepare_capture(device, label, config)?;
    capture.start()?;
    capture.run(sink, running, config.max_frames)
}
