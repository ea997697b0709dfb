//! Memory-mapped capture buffer pool
//!
//! Every buffer is owned by exactly one party at a time: nobody yet
//! (`Unqueued`), the driver (`QueuedToKernel`) or the application
//! (`DequeuedToApp`). Ownership only moves through [`BufferPool::dequeue`]
//! and [`BufferPool::requeue`].

use std::fmt;

use tracing::{debug, trace};

use super::device::{BufferInfo, CaptureDevice};
use super::sys::VIDEO_MAX_FRAME;
use crate::error::{AppError, Result};

/// Ownership state of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Unqueued,
    QueuedToKernel,
    DequeuedToApp,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Unqueued => write!(f, "unqueued"),
            BufferState::QueuedToKernel => write!(f, "queued to kernel"),
            BufferState::DequeuedToApp => write!(f, "dequeued to application"),
        }
    }
}

struct Buffer<M> {
    info: BufferInfo,
    mapping: M,
    state: BufferState,
}

/// A buffer currently owned by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub index: u32,
    /// Bytes filled by the driver, clamped to the mapped length
    pub bytes_used: usize,
    pub sequence: u32,
    pub flags: u32,
    pub field: u32,
}

/// Fixed-size pool of kernel buffers mapped into this process
pub struct BufferPool<D: CaptureDevice> {
    buffers: Vec<Buffer<D::Mapping>>,
}

impl<D: CaptureDevice> BufferPool<D> {
    /// Request, map and queue `count` buffers
    ///
    /// The driver may grant a different count; the granted count is used.
    /// On any per-buffer failure every mapping made so far is released
    /// before the error is returned.
    pub fn allocate(device: &D, count: u32) -> Result<Self> {
        if count == 0 || count > VIDEO_MAX_FRAME {
            return Err(AppError::BufferSetupFailed {
                op: "VIDIOC_REQBUFS",
                reason: format!("buffer count {} outside 1..={}", count, VIDEO_MAX_FRAME),
            });
        }

        let granted = device
            .request_buffers(count)
            .map_err(|e| AppError::BufferSetupFailed {
                op: "VIDIOC_REQBUFS",
                reason: e.to_string(),
            })?;
        if granted == 0 {
            return Err(AppError::BufferSetupFailed {
                op: "VIDIOC_REQBUFS",
                reason: "driver granted zero buffers".to_string(),
            });
        }
        if granted != count {
            debug!("Requested {} buffers, driver granted {}", count, granted);
        }

        // Dropping `pool` on an early return unmaps what was mapped so far.
        let mut pool = Self {
            buffers: Vec::with_capacity(granted as usize),
        };

        for index in 0..granted {
            let info = device
                .query_buffer(index)
                .map_err(|e| AppError::BufferSetupFailed {
                    op: "VIDIOC_QUERYBUF",
                    reason: format!("buffer {}: {}", index, e),
                })?;
            trace!(
                "Buffer {}: offset={:#x} length={} flags={:#x}",
                index,
                info.offset,
                info.length,
                info.flags
            );

            let mapping = device
                .map_buffer(&info)
                .map_err(|e| AppError::BufferSetupFailed {
                    op: "mmap",
                    reason: format!("buffer {}: {}", index, e),
                })?;

            let state = if info.is_queued() {
                BufferState::QueuedToKernel
            } else {
                BufferState::Unqueued
            };
            pool.buffers.push(Buffer {
                info,
                mapping,
                state,
            });

            if state == BufferState::Unqueued {
                device
                    .queue_buffer(index)
                    .map_err(|e| AppError::BufferSetupFailed {
                        op: "VIDIOC_QBUF",
                        reason: format!("buffer {}: {}", index, e),
                    })?;
                pool.buffers[index as usize].state = BufferState::QueuedToKernel;
            }
        }

        debug!("Buffer pool ready with {} buffers", pool.len());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffers.get(index as usize).map(|b| b.state)
    }

    pub fn states(&self) -> Vec<BufferState> {
        self.buffers.iter().map(|b| b.state).collect()
    }

    /// Number of buffers currently owned by the driver
    pub fn queued(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.state == BufferState::QueuedToKernel)
            .count()
    }

    /// Block until the driver returns a filled buffer
    pub fn dequeue(&mut self, device: &D) -> Result<BufferHandle> {
        let done = device
            .dequeue_buffer()
            .map_err(|e| AppError::DequeueFailed(format!("VIDIOC_DQBUF: {}", e)))?;

        let buffer = self.buffers.get_mut(done.index as usize).ok_or_else(|| {
            AppError::DequeueFailed(format!("driver returned unknown buffer {}", done.index))
        })?;
        if buffer.state != BufferState::QueuedToKernel {
            return Err(AppError::DequeueFailed(format!(
                "driver returned buffer {} which is {}",
                done.index, buffer.state
            )));
        }
        buffer.state = BufferState::DequeuedToApp;

        let mapped = buffer.mapping.as_ref().len();
        Ok(BufferHandle {
            index: done.index,
            bytes_used: (done.bytes_used as usize).min(mapped),
            sequence: done.sequence,
            flags: done.flags,
            field: done.field,
        })
    }

    /// Filled bytes of a dequeued buffer
    pub fn data(&self, handle: &BufferHandle) -> &[u8] {
        match self.buffers.get(handle.index as usize) {
            Some(b) if b.state == BufferState::DequeuedToApp => {
                &b.mapping.as_ref()[..handle.bytes_used]
            }
            _ => &[],
        }
    }

    /// Hand a dequeued buffer back to the driver
    pub fn requeue(&mut self, device: &D, index: u32) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or_else(|| AppError::RequeueFailed {
                index,
                reason: "no such buffer".to_string(),
            })?;
        if buffer.state != BufferState::DequeuedToApp {
            return Err(AppError::RequeueFailed {
                index,
                reason: format!("buffer is {}, not owned by the application", buffer.state),
            });
        }

        device
            .queue_buffer(index)
            .map_err(|e| AppError::RequeueFailed {
                index,
                reason: format!("VIDIOC_QBUF: {}", e),
            })?;
        buffer.state = BufferState::QueuedToKernel;
        Ok(())
    }

    /// Mark every buffer as reclaimed after STREAMOFF
    ///
    /// STREAMOFF removes all buffers from the driver's queues.
    pub fn reclaim(&mut self) {
        for buffer in &mut self.buffers {
            buffer.state = BufferState::Unqueued;
        }
    }

    /// Unmap all buffers
    pub fn release(self) {
        debug!("Unmapping {} buffers", self.buffers.len());
        drop(self.buffers);
    }

    /// Kernel-reported length of buffer `index`
    pub fn buffer_length(&self, index: u32) -> Option<u32> {
        self.buffers.get(index as usize).map(|b| b.info.length)
    }
}
