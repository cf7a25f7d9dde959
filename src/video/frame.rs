//! Decoded frame data and the shared latest-frame slot

use arc_swap::ArcSwapOption;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::format::{PixelFormat, Resolution};

/// Row alignment of decoded bitmaps, in bytes
pub const ROW_ALIGNMENT: usize = 4;

/// Bytes per row for a packed RGB24 bitmap of `width` pixels
pub fn rgb_stride(width: u32) -> usize {
    let row = width as usize * 3;
    row.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
}

/// A decoded bitmap ready for display
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Frame resolution
    pub resolution: Resolution,
    /// Bytes per row (>= width * 3)
    pub stride: usize,
    /// Pixel format (always RGB24)
    pub format: PixelFormat,
    /// Frame sequence number, assigned when published
    pub sequence: u64,
    /// Timestamp of the successful decode
    pub decoded_at: Instant,
    data: Vec<u8>,
}

impl DecodedFrame {
    /// Allocate a zeroed RGB24 bitmap, or `None` if the allocation fails
    pub fn try_alloc(resolution: Resolution) -> Option<Self> {
        let stride = rgb_stride(resolution.width);
        let len = stride.checked_mul(resolution.height as usize)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);
        Some(Self {
            resolution,
            stride,
            format: PixelFormat::Rgb24,
            sequence: 0,
            decoded_at: Instant::now(),
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Whole backing store including row padding
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pixel bytes of row `y`, without padding
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.resolution.height {
            return None;
        }
        let start = y as usize * self.stride;
        self.data.get(start..start + self.resolution.width as usize * 3)
    }

    /// RGB triple at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.resolution.width {
            return None;
        }
        let row = self.row(y)?;
        let offset = x as usize * 3;
        Some([row[offset], row[offset + 1], row[offset + 2]])
    }

    /// Copy rows into a tightly packed buffer (stride removed)
    pub fn to_packed_rgb(&self) -> Vec<u8> {
        let row_len = self.resolution.width as usize * 3;
        if self.stride == row_len {
            return self.data.clone();
        }
        let mut packed = Vec::with_capacity(row_len * self.resolution.height as usize);
        for y in 0..self.resolution.height {
            if let Some(row) = self.row(y) {
                packed.extend_from_slice(row);
            }
        }
        packed
    }

    /// Write the frame as a binary PPM (P6) image
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width(), self.height())?;
        for y in 0..self.resolution.height {
            if let Some(row) = self.row(y) {
                out.write_all(row)?;
            }
        }
        out.flush()
    }
}

/// Single-slot holder of the most recently decoded frame
///
/// The capture thread stores a new frame and then bumps the watch channel,
/// so a consumer woken by the signal always sees that frame (or a newer one).
pub struct FrameSlot {
    current: ArcSwapOption<DecodedFrame>,
    sequence: AtomicU64,
    notify: watch::Sender<u64>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (notify, _rx) = watch::channel(0);
        Self {
            current: ArcSwapOption::empty(),
            sequence: AtomicU64::new(0),
            notify,
        }
    }

    /// Publish a frame and signal subscribers; returns its sequence number
    pub fn publish(&self, mut frame: DecodedFrame) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        frame.sequence = sequence;
        self.current.store(Some(Arc::new(frame)));
        self.notify.send_replace(sequence);
        sequence
    }

    /// Latest published frame, if any
    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.current.load_full()
    }

    /// Subscribe to "new frame" signals (the value is the frame sequence)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Drop the published frame
    pub fn clear(&self) {
        self.current.store(None);
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
