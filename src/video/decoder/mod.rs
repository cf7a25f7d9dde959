//! Frame decoders
//!
//! Decoders turn a raw capture payload into a displayable RGB24 bitmap. A
//! decoder keeps a conversion context keyed by source dimensions and rebuilds
//! it whenever the incoming frame size changes.

pub mod mjpeg;

pub use mjpeg::MjpegDecoder;

use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::frame::DecodedFrame;

/// Capture payload decoder, owned by the capture thread
pub trait FrameDecoder: Send {
    /// Decoder name for logging
    fn name(&self) -> &'static str;

    /// Decode `data` into the context's output bitmap.
    ///
    /// `expected` is the negotiated size; the payload header wins if it
    /// disagrees.
    fn decode(&mut self, data: &[u8], expected: Resolution) -> Result<&DecodedFrame>;

    /// How many times the conversion context has been (re)built
    fn context_builds(&self) -> u64;
}
