//! In-memory `CaptureDevice` for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use v4l::buffer::Flags as BufferFlags;
use v4l::FourCC;

use super::device::{BufferInfo, CaptureDevice, DequeuedBuffer, DeviceCapabilities};
use super::format::{DeviceFormat, Resolution};
use super::uvc::{ProbeCommit, XuQuery, XuSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCall {
    pub unit: u8,
    pub selector: u8,
    pub query: u8,
    pub size: usize,
}

pub struct FakeState {
    pub capabilities: DeviceCapabilities,
    pub format: DeviceFormat,
    pub set_format_calls: u32,
    pub clamp_width: Option<u32>,
    pub fail_set_format: bool,

    pub buffer_length: u32,
    pub grant_limit: Option<u32>,
    pub granted: u32,
    pub prequeued: HashSet<u32>,
    pub fail_map_at: Option<u32>,
    pub fail_qbuf_at: Option<u32>,
    /// Fail the n-th QBUF call (1-based, counting setup calls)
    pub fail_qbuf_call: Option<u32>,
    pub qbuf_calls: u32,
    pub kernel_queue: VecDeque<u32>,

    pub frame_size: u32,
    pub sequence: u32,
    /// Sequence numbers to leave out, simulating dropped frames
    pub drop_sequences: HashSet<u32>,
    pub fail_dequeue_at: Option<u32>,
    pub dequeue_calls: u32,
    /// Clear the flag after this many successful dequeues
    pub stop_after: Option<(u32, Arc<AtomicBool>)>,

    pub streaming: bool,
    pub fail_stream_on: bool,
    pub stream_on_calls: u32,
    pub stream_off_calls: u32,

    pub controls: HashMap<u8, Vec<u8>>,
    pub control_calls: Vec<ControlCall>,
    pub fail_control_query: Option<(u8, u8)>,
    pub clamp_iframe_period: Option<u16>,

    live_mappings: Arc<AtomicUsize>,
    unmapped: Arc<AtomicUsize>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                video_capture: true,
                streaming: true,
            },
            format: DeviceFormat {
                resolution: Resolution::new(640, 480),
                fourcc: FourCC::new(b"YUYV"),
                stride: 1280,
                size: 640 * 480 * 2,
            },
            set_format_calls: 0,
            clamp_width: None,
            fail_set_format: false,
            buffer_length: 4096,
            grant_limit: None,
            granted: 0,
            prequeued: HashSet::new(),
            fail_map_at: None,
            fail_qbuf_at: None,
            fail_qbuf_call: None,
            qbuf_calls: 0,
            kernel_queue: VecDeque::new(),
            frame_size: 1000,
            sequence: 0,
            drop_sequences: HashSet::new(),
            fail_dequeue_at: None,
            dequeue_calls: 0,
            stop_after: None,
            streaming: false,
            fail_stream_on: false,
            stream_on_calls: 0,
            stream_off_calls: 0,
            controls: HashMap::new(),
            control_calls: Vec::new(),
            fail_control_query: None,
            clamp_iframe_period: None,
            live_mappings: Arc::new(AtomicUsize::new(0)),
            unmapped: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Cloning shares the underlying state, so a test can keep a handle after
/// moving the device into a session.
#[derive(Clone, Default)]
pub struct FakeDevice {
    inner: Arc<Mutex<FakeState>>,
}

pub struct FakeMapping {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
    unmapped: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for FakeMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for FakeMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.unmapped.fetch_add(1, Ordering::SeqCst);
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock()
    }

    /// Live mappings
    pub fn mapped(&self) -> usize {
        self.state().live_mappings.load(Ordering::SeqCst)
    }

    /// Mappings released so far
    pub fn unmapped(&self) -> usize {
        self.state().unmapped.load(Ordering::SeqCst)
    }

    /// Expose probe and commit controls holding `record`
    pub fn install_probe_commit(&self, record: ProbeCommit) {
        let bytes = record.to_bytes().to_vec();
        let mut state = self.state();
        state
            .controls
            .insert(XuSelector::VideoConfigProbe as u8, bytes.clone());
        state
            .controls
            .insert(XuSelector::VideoConfigCommit as u8, bytes);
    }

    /// Start streaming without going through STREAMON
    pub fn stream_on_now(&self) {
        self.state().streaming = true;
    }
}

impl CaptureDevice for FakeDevice {
    type Mapping = FakeMapping;

    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(self.state().capabilities)
    }

    fn get_format(&self) -> io::Result<DeviceFormat> {
        Ok(self.state().format)
    }

    fn set_format(&self, format: &DeviceFormat) -> io::Result<()> {
        let mut state = self.state();
        state.set_format_calls += 1;
        if state.fail_set_format {
            return Err(errno(libc::EBUSY));
        }
        let mut applied = *format;
        if let Some(width) = state.clamp_width {
            applied.resolution.width = applied.resolution.width.min(width);
        }
        applied.stride = applied.resolution.width * 2;
        applied.size = applied.stride * applied.resolution.height;
        state.format = applied;
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        let granted = state.grant_limit.map_or(count, |limit| limit.min(count));
        state.granted = granted;
        state.kernel_queue.clear();
        let mut prequeued: Vec<u32> = state
            .prequeued
            .iter()
            .copied()
            .filter(|i| *i < granted)
            .collect();
        prequeued.sort_unstable();
        state.kernel_queue.extend(prequeued);
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let state = self.state();
        if index >= state.granted {
            return Err(errno(libc::EINVAL));
        }
        let mut flags = BufferFlags::MAPPED.bits();
        if state.prequeued.contains(&index) {
            flags |= BufferFlags::QUEUED.bits();
        }
        Ok(BufferInfo {
            index,
            offset: index * state.buffer_length,
            length: state.buffer_length,
            flags,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<FakeMapping> {
        let state = self.state();
        if state.fail_map_at == Some(info.index) {
            return Err(errno(libc::ENOMEM));
        }
        state.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(FakeMapping {
            data: vec![info.index as u8; info.length as usize],
            live: state.live_mappings.clone(),
            unmapped: state.unmapped.clone(),
        })
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = self.state();
        state.qbuf_calls += 1;
        if state.fail_qbuf_call == Some(state.qbuf_calls) || state.fail_qbuf_at == Some(index) {
            return Err(errno(libc::EIO));
        }
        if index >= state.granted || state.kernel_queue.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        state.kernel_queue.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut state = self.state();
        state.dequeue_calls += 1;
        if !state.streaming {
            return Err(errno(libc::EINVAL));
        }
        if state.fail_dequeue_at == Some(state.sequence) {
            return Err(errno(libc::EIO));
        }
        let index = state.kernel_queue.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;

        while state.drop_sequences.contains(&state.sequence) {
            state.sequence += 1;
        }
        let sequence = state.sequence;
        state.sequence += 1;

        if let Some((after, flag)) = &state.stop_after {
            if sequence + 1 >= *after {
                flag.store(false, Ordering::SeqCst);
            }
        }

        Ok(DequeuedBuffer {
            index,
            bytes_used: state.frame_size,
            flags: (BufferFlags::MAPPED | BufferFlags::DONE).bits(),
            field: 1,
            sequence,
        })
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.state();
        state.stream_on_calls += 1;
        if state.fail_stream_on {
            return Err(errno(libc::ENOSPC));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.state();
        state.stream_off_calls += 1;
        state.streaming = false;
        state.kernel_queue.clear();
        Ok(())
    }

    fn control_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()> {
        let mut state = self.state();
        state.control_calls.push(ControlCall {
            unit,
            selector,
            query,
            size: data.len(),
        });
        if state.fail_control_query == Some((selector, query)) {
            return Err(errno(libc::EIO));
        }
        let clamp = state.clamp_iframe_period;
        let stored = state
            .controls
            .get_mut(&selector)
            .ok_or_else(|| errno(libc::ENOENT))?;

        if query == XuQuery::GetLen as u8 {
            if data.len() != 2 {
                return Err(errno(libc::EINVAL));
            }
            data.copy_from_slice(&(stored.len() as u16).to_ne_bytes());
            return Ok(());
        }
        if data.len() != stored.len() {
            return Err(errno(libc::EINVAL));
        }
        if query == XuQuery::GetCur as u8 {
            data.copy_from_slice(stored);
        } else if query == XuQuery::SetCur as u8 {
            stored.copy_from_slice(data);
            if let (Some(max), true) = (clamp, selector == XuSelector::VideoConfigProbe as u8) {
                let bytes: &[u8; ProbeCommit::SIZE] = stored
                    .as_slice()
                    .try_into()
                    .map_err(|_| errno(libc::EINVAL))?;
                let mut record = ProbeCommit::from_bytes(bytes);
                record.iframe_period = record.iframe_period.min(max);
                stored.copy_from_slice(&record.to_bytes());
            }
        } else {
            return Err(errno(libc::EINVAL));
        }
        Ok(())
    }
}
