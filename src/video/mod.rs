//! Video capture module
//!
//! V4L2 MJPEG capture: device handle, mmap buffer ring, controls, the
//! capture engine and its decoder.

pub mod buffer;
pub mod capture;
pub mod controls;
pub mod decoder;
pub mod device;
pub mod format;
pub mod frame;
pub mod v4l2;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::{BufferPool, BufferState, BUFFER_COUNT, MIN_PAYLOAD_SIZE};
pub use capture::{CaptureEngine, CaptureState, CaptureStats, EngineOptions};
pub use controls::{cid, ControlDescriptor, ControlKind, ControlName, ControlRegistry, PowerLineFrequency};
pub use decoder::{FrameDecoder, MjpegDecoder};
pub use device::{DeviceCapabilities, DeviceDescriptor, DeviceHandle, DeviceOpener, VideoDriver};
pub use format::{FrameInterval, PixelFormat, Resolution};
pub use frame::{DecodedFrame, FrameSlot};
pub use v4l2::V4l2Opener;
