//! Video device handle and the driver protocol it is built on
//!
//! `VideoDriver` is the raw capture protocol (capabilities, format, buffer
//! ioctls, controls). The V4L2 implementation lives in [`super::v4l2`];
//! everything above this module only talks to the trait.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::controls::{ControlDescriptor, ControlRegistry};
use super::format::{FrameInterval, Resolution};
use crate::error::{AppError, Result};

/// Device selection and negotiated capture parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device path (e.g., /dev/video0)
    pub device_path: PathBuf,
    /// Capture resolution
    pub resolution: Resolution,
    /// Frame rate in frames per second
    pub fps: u32,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            resolution: Resolution::SVGA,
            fps: 30,
        }
    }
}

impl DeviceDescriptor {
    /// Create descriptor for a specific device
    pub fn for_device(path: impl AsRef<Path>) -> Self {
        Self {
            device_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// Set frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn frame_interval(&self) -> FrameInterval {
        FrameInterval::from_fps(self.fps)
    }
}

/// Device capabilities relevant to streaming capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub can_capture: bool,
    pub can_stream: bool,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: usize,
}

/// A driver buffer mapped into process memory
pub trait BufferMapping: Send {
    /// Mapped length in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the first `bytes_used` bytes of the region into `dst`
    fn read_into(&self, bytes_used: usize, dst: &mut Vec<u8>);

    /// Release the mapping
    fn unmap(self: Box<Self>) -> Result<()>;
}

/// Raw capture-driver protocol for one open device
pub trait VideoDriver: Send + Sync {
    /// Path this driver was opened from
    fn path(&self) -> &Path;

    fn query_capabilities(&self) -> Result<DeviceCapabilities>;

    /// Request MJPEG at `requested`; returns the size the driver accepted
    fn negotiate_format(&self, requested: Resolution) -> Result<Resolution>;

    fn set_frame_rate(&self, interval: FrameInterval) -> Result<()>;

    /// Ask for `count` mmap buffers; returns the number granted
    fn request_buffers(&self, count: u32) -> Result<u32>;

    fn map_buffer(&self, index: u32) -> Result<Box<dyn BufferMapping>>;

    fn queue_buffer(&self, index: u32) -> Result<()>;

    /// Block until the driver has filled a buffer
    fn dequeue_buffer(&self) -> Result<DequeuedBuffer>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;

    fn query_control(&self, id: u32) -> Result<ControlDescriptor>;

    fn read_control(&self, id: u32) -> Result<i32>;

    fn write_control(&self, id: u32, value: i32) -> Result<()>;
}

/// Factory that opens device nodes
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn VideoDriver>>;
}

/// Owner of at most one open device
pub struct DeviceHandle {
    opener: Arc<dyn DeviceOpener>,
    driver: Option<Arc<dyn VideoDriver>>,
}

impl DeviceHandle {
    pub fn new(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            opener,
            driver: None,
        }
    }

    /// Open a video device by path
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(driver) = &self.driver {
            return Err(AppError::AlreadyOpen(driver.path().display().to_string()));
        }
        debug!("Opening video device: {:?}", path);
        self.driver = Some(self.opener.open(path)?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    /// Shared reference to the open driver
    pub fn driver(&self) -> Result<Arc<dyn VideoDriver>> {
        self.driver.clone().ok_or(AppError::NotOpen)
    }

    pub fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        self.driver()?.query_capabilities()
    }

    /// Negotiate MJPEG capture; the returned size is authoritative
    pub fn negotiate_format(&self, width: u32, height: u32) -> Result<Resolution> {
        let requested = Resolution::new(width, height);
        let actual = self.driver()?.negotiate_format(requested)?;
        if actual != requested {
            warn!("Requested {}, got {}", requested, actual);
        }
        Ok(actual)
    }

    pub fn set_frame_rate(&self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(AppError::RateUnsupported("0 fps".to_string()));
        }
        self.driver()?.set_frame_rate(FrameInterval::from_fps(fps))
    }

    pub fn get_control(&self, id: u32) -> Result<i32> {
        ControlRegistry::new(self.driver()?).get(id)
    }

    /// Write a control; values outside [min, max] are ignored
    pub fn set_control(&self, id: u32, value: i32) -> Result<()> {
        ControlRegistry::new(self.driver()?).set(id, value)
    }

    /// Write a control, failing with `ControlOutOfRange` outside [min, max]
    pub fn set_control_strict(&self, id: u32, value: i32) -> Result<()> {
        ControlRegistry::new(self.driver()?).set_strict(id, value)
    }

    /// Release the device; safe to call repeatedly
    pub fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            info!("Closing video device {:?}", driver.path());
        }
    }
}
