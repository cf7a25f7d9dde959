//! V4L2 driver backed by the v4l crate and raw ioctls

use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_control, v4l2_queryctrl, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Format;

use super::controls::{ControlDescriptor, ControlKind};
use super::device::{
    BufferMapping, DequeuedBuffer, DeviceCapabilities, DeviceOpener, VideoDriver,
};
use super::format::{FrameInterval, PixelFormat, Resolution};
use crate::error::{AppError, Result};

const BUF_TYPE: u32 = v4l::buffer::Type::VideoCapture as u32;
const MEMORY_MMAP: u32 = v4l::memory::Memory::Mmap as u32;

/// Default wait for a filled buffer before DQBUF reports a timeout
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens real device nodes
#[derive(Debug, Clone)]
pub struct V4l2Opener {
    timeout: Duration,
}

impl V4l2Opener {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for V4l2Opener {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOpener for V4l2Opener {
    fn open(&self, path: &Path) -> Result<Arc<dyn VideoDriver>> {
        Ok(Arc::new(V4l2Device::open(path, self.timeout)?))
    }
}

/// One open V4L2 capture node
pub struct V4l2Device {
    path: PathBuf,
    device: Device,
    fd: RawFd,
    timeout: Duration,
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let device = Device::with_path(path).map_err(|e| AppError::from_open(path, e))?;
        let fd = device.handle().fd();
        debug!("Opened {:?} (fd {})", path, fd);
        Ok(Self {
            path: path.to_path_buf(),
            device,
            fd,
            timeout,
        })
    }

    fn wait_ready(&self) -> std::io::Result<()> {
        if self.timeout.is_zero() {
            return Ok(());
        }
        // SAFETY: the fd is owned by `self.device` and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = self.timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))?;
        if ready == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "capture timeout",
            ));
        }
        Ok(())
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> std::io::Result<()> {
        // SAFETY: `arg` is the struct type the request expects
        unsafe { v4l2::ioctl(self.fd, request, arg as *mut T as *mut std::os::raw::c_void) }
    }

    fn stream_type_ioctl(&self, request: vidioc::_IOC_TYPE) -> std::io::Result<()> {
        let mut typ = BUF_TYPE as std::os::raw::c_int;
        self.ioctl(request, &mut typ)
    }
}

impl VideoDriver for V4l2Device {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        let caps = self
            .device
            .query_caps()
            .map_err(|e| AppError::QueryFailed(e.to_string()))?;
        debug!("Device {:?}: driver={} card={}", self.path, caps.driver, caps.card);
        Ok(DeviceCapabilities {
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn negotiate_format(&self, requested: Resolution) -> Result<Resolution> {
        let fmt = Format::new(
            requested.width,
            requested.height,
            PixelFormat::Mjpeg.to_fourcc(),
        );
        let actual = self
            .device
            .set_format(&fmt)
            .map_err(|e| AppError::FormatUnsupported(e.to_string()))?;

        if PixelFormat::from_fourcc(actual.fourcc) != Some(PixelFormat::Mjpeg) {
            return Err(AppError::FormatUnsupported(format!(
                "device selected {} instead of MJPG",
                actual.fourcc
            )));
        }
        Ok(Resolution::new(actual.width, actual.height))
    }

    fn set_frame_rate(&self, interval: FrameInterval) -> Result<()> {
        let params = v4l::video::capture::Parameters::with_fps(interval.fps());
        let actual = self
            .device
            .set_params(&params)
            .map_err(|e| AppError::RateUnsupported(e.to_string()))?;
        if actual.interval.denominator != interval.denominator
            || actual.interval.numerator != interval.numerator
        {
            warn!(
                "Requested {} fps, driver set {}/{}",
                interval.fps(),
                actual.interval.numerator,
                actual.interval.denominator
            );
        }
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = BUF_TYPE;
        req.memory = MEMORY_MMAP;
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)
            .map_err(|e| AppError::AllocationFailed(e.to_string()))?;
        Ok(req.count)
    }

    fn map_buffer(&self, index: u32) -> Result<Box<dyn BufferMapping>> {
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)
            .map_err(|e| AppError::MapFailed {
                index,
                reason: format!("QUERYBUF: {}", e),
            })?;

        let length = buf.length as usize;
        // SAFETY: QUERYBUF on an MMAP buffer fills the `offset` member
        let offset = unsafe { buf.m.offset };
        // SAFETY: length and offset come straight from the driver
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|e| AppError::MapFailed {
            index,
            reason: e.to_string(),
        })?;

        Ok(Box::new(MmapRegion {
            index,
            ptr: Some(ptr as *mut u8),
            len: length,
        }))
    }

    fn queue_buffer(&self, index: u32) -> Result<()> {
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
            .map_err(|e| AppError::QueueFailed {
                index,
                reason: e.to_string(),
            })
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        self.wait_ready()
            .map_err(|e| AppError::DequeueFailed(e.to_string()))?;

        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)
            .map_err(|e| AppError::DequeueFailed(e.to_string()))?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn stream_on(&self) -> Result<()> {
        self.stream_type_ioctl(vidioc::VIDIOC_STREAMON)
            .map_err(|e| AppError::StreamFailed(format!("STREAMON: {}", e)))
    }

    fn stream_off(&self) -> Result<()> {
        self.stream_type_ioctl(vidioc::VIDIOC_STREAMOFF)
            .map_err(|e| AppError::StreamFailed(format!("STREAMOFF: {}", e)))
    }

    fn query_control(&self, id: u32) -> Result<ControlDescriptor> {
        let mut query: v4l2_queryctrl = unsafe { std::mem::zeroed() };
        query.id = id;
        self.ioctl(vidioc::VIDIOC_QUERYCTRL, &mut query)
            .map_err(|e| AppError::ControlQuery {
                id,
                reason: e.to_string(),
            })?;

        let name_len = query
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(query.name.len());
        let name = String::from_utf8_lossy(&query.name[..name_len]).into_owned();

        Ok(ControlDescriptor {
            id,
            name,
            kind: ControlKind::classify(query.type_, query.flags),
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default: query.default_value,
        })
    }

    fn read_control(&self, id: u32) -> Result<i32> {
        let mut ctrl = v4l2_control { id, value: 0 };
        self.ioctl(vidioc::VIDIOC_G_CTRL, &mut ctrl)
            .map_err(|e| AppError::ControlQuery {
                id,
                reason: e.to_string(),
            })?;
        Ok(ctrl.value)
    }

    fn write_control(&self, id: u32, value: i32) -> Result<()> {
        let mut ctrl = v4l2_control { id, value };
        self.ioctl(vidioc::VIDIOC_S_CTRL, &mut ctrl)
            .map_err(|e| AppError::ControlQuery {
                id,
                reason: e.to_string(),
            })
    }
}

/// A read-only mmap of one driver buffer
struct MmapRegion {
    index: u32,
    ptr: Option<*mut u8>,
    len: usize,
}

// SAFETY: the region is only read, and only by the thread that owns the pool
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    fn release(&mut self) -> std::io::Result<()> {
        match self.ptr.take() {
            // SAFETY: ptr/len describe a live mapping created in `map_buffer`
            Some(ptr) => unsafe { v4l2::munmap(ptr as *mut std::os::raw::c_void, self.len) },
            None => Ok(()),
        }
    }
}

impl BufferMapping for MmapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read_into(&self, bytes_used: usize, dst: &mut Vec<u8>) {
        dst.clear();
        let Some(ptr) = self.ptr else {
            return;
        };
        let n = bytes_used.min(self.len);
        // SAFETY: the mapping is live and `n` is within its length
        let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, n) };
        dst.extend_from_slice(src);
    }

    fn unmap(mut self: Box<Self>) -> Result<()> {
        let index = self.index;
        self.release().map_err(|e| AppError::UnmapFailed {
            index,
            reason: e.to_string(),
        })
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!("Failed to unmap buffer {}: {}", self.index, e);
        }
    }
}
