//! camview - MJPEG webcam capture for V4L2 devices
//!
//! Opens a camera, negotiates MJPEG, streams through a small ring of mmap
//! buffers on a background thread and publishes the latest decoded RGB frame.

pub mod config;
pub mod error;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
