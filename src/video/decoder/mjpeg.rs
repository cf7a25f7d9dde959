//! MJPEG decoder using TurboJPEG (software) -> RGB24

use std::time::Instant;
use tracing::{debug, trace};
use turbojpeg::{Decompressor, Image, PixelFormat as TJPixelFormat};

use super::FrameDecoder;
use crate::error::{AppError, Result};
use crate::video::format::Resolution;
use crate::video::frame::DecodedFrame;

/// JPEG start-of-image marker
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Output geometry for one source size
struct ConversionContext {
    resolution: Resolution,
    frame: DecodedFrame,
}

impl ConversionContext {
    fn build(resolution: Resolution) -> Result<Self> {
        let frame = DecodedFrame::try_alloc(resolution).ok_or_else(|| {
            AppError::DecodeError(format!("Failed to allocate {} output bitmap", resolution))
        })?;
        Ok(Self { resolution, frame })
    }
}

pub struct MjpegDecoder {
    decompressor: Decompressor,
    context: Option<ConversionContext>,
    context_builds: u64,
}

impl MjpegDecoder {
    pub fn new() -> Result<Self> {
        let decompressor = Decompressor::new().map_err(|e| {
            AppError::DecodeError(format!("Failed to create turbojpeg decoder: {}", e))
        })?;
        Ok(Self {
            decompressor,
            context: None,
            context_builds: 0,
        })
    }

    /// Current context size, if one has been built
    pub fn context_resolution(&self) -> Option<Resolution> {
        self.context.as_ref().map(|c| c.resolution)
    }

    fn ensure_context(&mut self, resolution: Resolution) -> Result<()> {
        if self
            .context
            .as_ref()
            .is_some_and(|c| c.resolution == resolution)
        {
            return Ok(());
        }
        // Drop the old output store before allocating the new one
        self.context = None;
        let context = ConversionContext::build(resolution)?;
        self.context_builds += 1;
        debug!(
            "Built MJPEG conversion context for {} (stride {})",
            resolution, context.frame.stride
        );
        self.context = Some(context);
        Ok(())
    }
}

impl FrameDecoder for MjpegDecoder {
    fn name(&self) -> &'static str {
        "turbojpeg"
    }

    fn decode(&mut self, data: &[u8], expected: Resolution) -> Result<&DecodedFrame> {
        if data.len() < 2 || data[..2] != JPEG_SOI {
            return Err(AppError::DecodeError(
                "payload does not start with a JPEG SOI marker".to_string(),
            ));
        }

        let header = self
            .decompressor
            .read_header(data)
            .map_err(|e| AppError::DecodeError(format!("turbojpeg read_header failed: {}", e)))?;

        let actual = Resolution::new(header.width as u32, header.height as u32);
        if actual.width == 0 || actual.height == 0 {
            return Err(AppError::DecodeError(format!(
                "empty JPEG size {}",
                actual
            )));
        }
        if actual != expected {
            trace!("JPEG is {}, negotiated {}", actual, expected);
        }

        self.ensure_context(actual)?;
        let Some(context) = self.context.as_mut() else {
            return Err(AppError::DecodeError(
                "conversion context missing".to_string(),
            ));
        };

        let frame = &mut context.frame;
        let image = Image {
            pixels: frame.data_mut(),
            width: header.width,
            pitch: frame.stride,
            height: header.height,
            format: TJPixelFormat::RGB,
        };

        self.decompressor
            .decompress(data, image)
            .map_err(|e| AppError::DecodeError(format!("turbojpeg decode failed: {}", e)))?;
        frame.decoded_at = Instant::now();

        Ok(&context.frame)
    }

    fn context_builds(&self) -> u64 {
        self.context_builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::mock::{jpeg_fixture, jpeg_fixture_color};

    #[test]
    fn test_decode_output_matches_header() {
        let mut decoder = MjpegDecoder::new().unwrap();
        let jpeg = jpeg_fixture_color(64, 48, [200, 40, 40]);

        let frame = decoder.decode(&jpeg, Resolution::new(64, 48)).unwrap();
        assert_eq!(frame.resolution, Resolution::new(64, 48));
        assert_eq!(frame.stride, 192);
        let [r, g, b] = frame.pixel(10, 10).unwrap();
        assert!(r > 150 && g < 90 && b < 90, "got {:?}", (r, g, b));
    }

    #[test]
    fn test_context_rebuilt_once_per_size_change() {
        let mut decoder = MjpegDecoder::new().unwrap();
        let large = jpeg_fixture(80, 60);
        let small = jpeg_fixture(64, 48);

        decoder.decode(&large, Resolution::new(80, 60)).unwrap();
        decoder.decode(&large, Resolution::new(80, 60)).unwrap();
        assert_eq!(decoder.context_builds(), 1);

        // Header size wins over the negotiated size
        let frame = decoder.decode(&small, Resolution::new(80, 60)).unwrap();
        assert_eq!(frame.resolution, Resolution::new(64, 48));
        decoder.decode(&small, Resolution::new(64, 48)).unwrap();
        assert_eq!(decoder.context_builds(), 2);
        assert_eq!(decoder.context_resolution(), Some(Resolution::new(64, 48)));
    }

    #[test]
    fn test_odd_width_uses_padded_stride() {
        let mut decoder = MjpegDecoder::new().unwrap();
        let jpeg = jpeg_fixture(33, 17);
        let frame = decoder.decode(&jpeg, Resolution::new(33, 17)).unwrap();
        assert_eq!(frame.stride, 100);
        assert_eq!(frame.to_packed_rgb().len(), 33 * 17 * 3);
    }

    #[test]
    fn test_tiny_frames_decode() {
        let mut decoder = MjpegDecoder::new().unwrap();
        let jpeg = jpeg_fixture(8, 8);
        let frame = decoder.decode(&jpeg, Resolution::new(8, 8)).unwrap();
        assert_eq!(frame.resolution, Resolution::new(8, 8));
        assert_eq!(frame.stride, 24);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let mut decoder = MjpegDecoder::new().unwrap();
        assert!(matches!(
            decoder.decode(&[0u8; 512], Resolution::VGA),
            Err(AppError::DecodeError(_))
        ));

        let mut truncated = jpeg_fixture(64, 48);
        truncated.truncate(4);
        assert!(matches!(
            decoder.decode(&truncated, Resolution::new(64, 48)),
            Err(AppError::DecodeError(_))
        ));
        assert_eq!(decoder.context_builds(), 0);
    }
}
