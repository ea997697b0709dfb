//! Async capture front-end
//!
//! Runs the blocking capture loop on a tokio blocking thread and publishes
//! its state through a watch channel.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::capture::{prepare_capture, CaptureStats};
use super::device::{CaptureDevice, V4l2Device};
use crate::config::CaptureConfig;
use crate::error::{AppError, Result};
use crate::sink::FrameSink;

/// Video capturer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturerState {
    /// Not started, or finished cleanly
    Stopped,
    /// Opening and negotiating
    Starting,
    /// Streaming
    Running,
    /// Setup or capture failed
    Error,
}

/// Async video capturer
pub struct VideoCapturer {
    config: CaptureConfig,
    state: Arc<watch::Sender<CapturerState>>,
    state_rx: watch::Receiver<CapturerState>,
    running: Arc<AtomicBool>,
    capture_handle: Mutex<Option<JoinHandle<Result<CaptureStats>>>>,
    /// Last error that occurred
    last_error: Arc<parking_lot::RwLock<Option<String>>>,
}

impl VideoCapturer {
    pub fn new(config: CaptureConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(CapturerState::Stopped);

        Self {
            config,
            state: Arc::new(state_tx),
            state_rx,
            running: Arc::new(AtomicBool::new(false)),
            capture_handle: Mutex::new(None),
            last_error: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    /// Get current capture state
    pub fn state(&self) -> CapturerState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<CapturerState> {
        self.state_rx.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state() == CapturerState::Running
    }

    /// Start capturing from the configured V4L2 node in the background
    pub async fn start<S>(&self, sink: S) -> Result<()>
    where
        S: FrameSink + Send + 'static,
    {
        let path = self.config.device.clone();
        self.start_with(move || V4l2Device::open(path), sink).await
    }

    /// Start capturing from the device returned by `open`
    ///
    /// `open` runs on the blocking thread. Does nothing if a capture is
    /// already starting or running.
    pub async fn start_with<D, F, S>(&self, open: F, mut sink: S) -> Result<()>
    where
        D: CaptureDevice + 'static,
        F: FnOnce() -> io::Result<D> + Send + 'static,
        S: FrameSink + Send + 'static,
    {
        let mut handle_slot = self.capture_handle.lock().await;
        let current_state = self.state();
        if current_state == CapturerState::Running || current_state == CapturerState::Starting {
            return Ok(());
        }

        info!(
            "Starting capture on {:?} into {}",
            self.config.device,
            sink.name()
        );

        let _ = self.state.send(CapturerState::Starting);
        *self.last_error.write() = None;
        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let state = self.state.clone();
        let running = self.running.clone();
        let last_error = self.last_error.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let result = capture_thread(open, &config, &mut sink, &state, &running);
            match &result {
                Ok(_) => {
                    let _ = state.send(CapturerState::Stopped);
                }
                Err(e) => {
                    error!("Capture error: {}", e);
                    *last_error.write() = Some(e.to_string());
                    let _ = state.send(CapturerState::Error);
                }
            }
            result
        });

        *handle_slot = Some(handle);
        Ok(())
    }

    /// Ask the loop to stop and wait for cleanup
    ///
    /// The loop notices the request after the frame it is waiting for.
    pub async fn stop(&self) -> Result<Option<CaptureStats>> {
        info!("Stopping capture");
        self.running.store(false, Ordering::SeqCst);
        self.wait().await
    }

    /// Wait for the background capture to finish
    ///
    /// Returns `None` when no capture was started since the last wait.
    pub async fn wait(&self) -> Result<Option<CaptureStats>> {
        let Some(handle) = self.capture_handle.lock().await.take() else {
            return Ok(None);
        };
        let stats = handle
            .await
            .map_err(|e| AppError::Io(io::Error::other(format!("capture task failed: {}", e))))??;
        Ok(Some(stats))
    }
}

fn capture_thread<D, F, S>(
    open: F,
    config: &CaptureConfig,
    sink: &mut S,
    state: &watch::Sender<CapturerState>,
    running: &AtomicBool,
) -> Result<CaptureStats>
where
    D: CaptureDevice,
    F: FnOnce() -> io::Result<D>,
    S: FrameSink,
{
    let device = open().map_err(|e| AppError::OpenFailed {
        device: config.device.clone(),
        source: e,
    })?;
    let label: PathBuf = config.device.clone();
    let mut capture = prepare_capture(device, &label, config)?;
    capture.start()?;
    let _ = state.send(CapturerState::Running);
    capture.run(sink, running, config.max_frames)
}
