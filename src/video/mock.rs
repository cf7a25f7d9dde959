//! In-process fake driver for tests

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::controls::{ControlDescriptor, ControlKind};
use super::device::{
    BufferMapping, DequeuedBuffer, DeviceCapabilities, DeviceOpener, VideoDriver,
};
use super::format::{FrameInterval, Resolution};
use crate::error::{AppError, Result};

const MOCK_BUFFER_SIZE: usize = 512 * 1024;

/// Idle wait when no frame is scripted, mimicking a poll timeout
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Encode a solid-colour RGB image as JPEG
pub(crate) fn jpeg_fixture_color(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let pixels: Vec<u8> = rgb
        .iter()
        .copied()
        .cycle()
        .take(width as usize * height as usize * 3)
        .collect();
    let image = turbojpeg::Image {
        pixels: pixels.as_slice(),
        width: width as usize,
        pitch: width as usize * 3,
        height: height as usize,
        format: turbojpeg::PixelFormat::RGB,
    };
    turbojpeg::compress(image, 85, turbojpeg::Subsamp::Sub2x2)
        .expect("compress fixture")
        .to_vec()
}

pub(crate) fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    jpeg_fixture_color(width, height, [90, 160, 220])
}

struct MockControl {
    descriptor: ControlDescriptor,
    value: i32,
}

struct MockState {
    capabilities: DeviceCapabilities,
    max_resolution: Resolution,
    format: Option<Resolution>,
    interval: Option<FrameInterval>,
    granted_override: Option<u32>,
    buffers: Vec<Arc<Mutex<Vec<u8>>>>,
    queued: VecDeque<u32>,
    max_queued: usize,
    payloads: VecDeque<Vec<u8>>,
    idle_payload: Option<Vec<u8>>,
    streaming: bool,
    stream_on_calls: usize,
    stream_off_calls: usize,
    fail_stream_on: bool,
    fail_format: bool,
    fail_map_at: Option<u32>,
    fail_stream_off: bool,
    /// Successful QBUF calls left before every further one fails
    queue_budget: Option<usize>,
    controls: HashMap<u32, MockControl>,
    writes: Vec<(u32, i32)>,
}

/// Scriptable stand-in for a V4L2 capture device
pub(crate) struct MockDriver {
    path: PathBuf,
    state: Mutex<MockState>,
    live_mappings: Arc<AtomicUsize>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::at("/dev/video0")
    }

    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(MockState {
                capabilities: DeviceCapabilities {
                    can_capture: true,
                    can_stream: true,
                },
                max_resolution: Resolution::HD1080,
                format: None,
                interval: None,
                granted_override: None,
                buffers: Vec::new(),
                queued: VecDeque::new(),
                max_queued: 0,
                payloads: VecDeque::new(),
                idle_payload: None,
                streaming: false,
                stream_on_calls: 0,
                stream_off_calls: 0,
                fail_stream_on: false,
                fail_format: false,
                fail_map_at: None,
                fail_stream_off: false,
                queue_budget: None,
                controls: HashMap::new(),
                writes: Vec::new(),
            }),
            live_mappings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_max_resolution(self, max: Resolution) -> Self {
        self.state.lock().max_resolution = max;
        self
    }

    pub fn with_capabilities(self, capabilities: DeviceCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    pub fn with_granted_buffers(self, granted: u32) -> Self {
        self.state.lock().granted_override = Some(granted);
        self
    }

    pub fn with_map_failure_at(self, index: u32) -> Self {
        self.state.lock().fail_map_at = Some(index);
        self
    }

    pub fn with_stream_on_failure(self) -> Self {
        self.state.lock().fail_stream_on = true;
        self
    }

    pub fn with_format_failure(self) -> Self {
        self.state.lock().fail_format = true;
        self
    }

    pub fn with_stream_off_failure(self) -> Self {
        self.state.lock().fail_stream_off = true;
        self
    }

    /// Let `n` QBUF calls succeed, then fail every later one
    pub fn with_queue_failure_after(self, n: usize) -> Self {
        self.state.lock().queue_budget = Some(n);
        self
    }

    /// Script one frame; frames are delivered in order
    pub fn push_payload(&self, payload: Vec<u8>) {
        self.state.lock().payloads.push_back(payload);
    }

    /// Frame delivered whenever the script is empty
    pub fn set_idle_payload(&self, payload: Option<Vec<u8>>) {
        self.state.lock().idle_payload = payload;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_control(
        &self,
        id: u32,
        kind: ControlKind,
        minimum: i32,
        maximum: i32,
        step: i32,
        default: i32,
        value: i32,
    ) {
        self.state.lock().controls.insert(
            id,
            MockControl {
                descriptor: ControlDescriptor {
                    id,
                    name: format!("Control {:#x}", id),
                    kind,
                    minimum,
                    maximum,
                    step,
                    default,
                },
                value,
            },
        );
    }

    /// Change a control value without recording a write
    pub fn set_control_value(&self, id: u32, value: i32) {
        if let Some(control) = self.state.lock().controls.get_mut(&id) {
            control.value = value;
        }
    }

    pub fn control_value(&self, id: u32) -> Option<i32> {
        self.state.lock().controls.get(&id).map(|c| c.value)
    }

    pub fn control_writes(&self) -> Vec<(u32, i32)> {
        self.state.lock().writes.clone()
    }

    pub fn format(&self) -> Option<Resolution> {
        self.state.lock().format
    }

    pub fn frame_interval(&self) -> Option<FrameInterval> {
        self.state.lock().interval
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn stream_on_calls(&self) -> usize {
        self.state.lock().stream_on_calls
    }

    pub fn stream_off_calls(&self) -> usize {
        self.state.lock().stream_off_calls
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn max_queued(&self) -> usize {
        self.state.lock().max_queued
    }

    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }
}

impl VideoDriver for MockDriver {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        Ok(self.state.lock().capabilities)
    }

    fn negotiate_format(&self, requested: Resolution) -> Result<Resolution> {
        let mut state = self.state.lock();
        if state.fail_format {
            return Err(AppError::FormatUnsupported("MJPG not offered".to_string()));
        }
        if !state.buffers.is_empty() {
            return Err(AppError::FormatUnsupported("device busy".to_string()));
        }
        let max = state.max_resolution;
        let actual = if requested.width > max.width || requested.height > max.height {
            max
        } else {
            requested
        };
        state.format = Some(actual);
        Ok(actual)
    }

    fn set_frame_rate(&self, interval: FrameInterval) -> Result<()> {
        self.state.lock().interval = Some(interval);
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut state = self.state.lock();
        if state.streaming {
            return Err(AppError::AllocationFailed("device busy".to_string()));
        }
        state.queued.clear();
        if count == 0 {
            state.buffers.clear();
            return Ok(0);
        }
        let granted = state.granted_override.unwrap_or(count);
        state.buffers = (0..granted)
            .map(|_| Arc::new(Mutex::new(vec![0u8; MOCK_BUFFER_SIZE])))
            .collect();
        Ok(granted)
    }

    fn map_buffer(&self, index: u32) -> Result<Box<dyn BufferMapping>> {
        let state = self.state.lock();
        if state.fail_map_at == Some(index) {
            return Err(AppError::MapFailed {
                index,
                reason: "ENOMEM".to_string(),
            });
        }
        let data = state
            .buffers
            .get(index as usize)
            .cloned()
            .ok_or_else(|| AppError::MapFailed {
                index,
                reason: "EINVAL".to_string(),
            })?;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMapping {
            data,
            live: self.live_mappings.clone(),
        }))
    }

    fn queue_buffer(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        if index as usize >= state.buffers.len() || state.queued.contains(&index) {
            return Err(AppError::QueueFailed {
                index,
                reason: "EINVAL".to_string(),
            });
        }
        match state.queue_budget {
            Some(0) => {
                return Err(AppError::QueueFailed {
                    index,
                    reason: "EIO".to_string(),
                })
            }
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        state.queued.push_back(index);
        state.max_queued = state.max_queued.max(state.queued.len());
        Ok(())
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        {
            let mut state = self.state.lock();
            if !state.streaming {
                return Err(AppError::DequeueFailed("not streaming".to_string()));
            }
            if !state.queued.is_empty() {
                let payload = match state.payloads.pop_front() {
                    Some(payload) => Some(payload),
                    None => state.idle_payload.clone(),
                };
                if let Some(payload) = payload {
                    let index = state.queued.pop_front().unwrap_or_default();
                    let buffer = state.buffers[index as usize].clone();
                    let mut data = buffer.lock();
                    let n = payload.len().min(data.len());
                    data[..n].copy_from_slice(&payload[..n]);
                    return Ok(DequeuedBuffer {
                        index,
                        bytes_used: n,
                    });
                }
            }
        }
        thread::sleep(IDLE_WAIT);
        Err(AppError::DequeueFailed("capture timeout".to_string()))
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.stream_on_calls += 1;
        if state.fail_stream_on {
            return Err(AppError::StreamFailed("STREAMON: EIO".to_string()));
        }
        if state.streaming {
            return Err(AppError::StreamFailed("already streaming".to_string()));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.stream_off_calls += 1;
        if state.fail_stream_off {
            return Err(AppError::StreamFailed("STREAMOFF: EIO".to_string()));
        }
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn query_control(&self, id: u32) -> Result<ControlDescriptor> {
        self.state
            .lock()
            .controls
            .get(&id)
            .map(|c| c.descriptor.clone())
            .ok_or_else(|| AppError::ControlQuery {
                id,
                reason: "EINVAL".to_string(),
            })
    }

    fn read_control(&self, id: u32) -> Result<i32> {
        self.state
            .lock()
            .controls
            .get(&id)
            .map(|c| c.value)
            .ok_or_else(|| AppError::ControlQuery {
                id,
                reason: "EINVAL".to_string(),
            })
    }

    fn write_control(&self, id: u32, value: i32) -> Result<()> {
        let mut state = self.state.lock();
        match state.controls.get_mut(&id) {
            Some(control) => {
                control.value = value;
                state.writes.push((id, value));
                Ok(())
            }
            None => Err(AppError::ControlQuery {
                id,
                reason: "EINVAL".to_string(),
            }),
        }
    }
}

struct MockMapping {
    data: Arc<Mutex<Vec<u8>>>,
    live: Arc<AtomicUsize>,
}

impl BufferMapping for MockMapping {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_into(&self, bytes_used: usize, dst: &mut Vec<u8>) {
        let data = self.data.lock();
        dst.clear();
        dst.extend_from_slice(&data[..bytes_used.min(data.len())]);
    }

    fn unmap(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opener that hands out pre-built mock drivers by path
pub(crate) struct MockOpener {
    fallback: Option<Arc<MockDriver>>,
    devices: HashMap<PathBuf, Arc<MockDriver>>,
}

impl MockOpener {
    /// Every path opens `driver`
    pub fn new(driver: Arc<MockDriver>) -> Self {
        Self {
            fallback: Some(driver),
            devices: HashMap::new(),
        }
    }

    /// No device exists
    pub fn missing() -> Self {
        Self {
            fallback: None,
            devices: HashMap::new(),
        }
    }

    /// Only the listed paths exist
    pub fn with_devices(devices: Vec<Arc<MockDriver>>) -> Self {
        Self {
            fallback: None,
            devices: devices
                .into_iter()
                .map(|d| (d.path.clone(), d))
                .collect(),
        }
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn VideoDriver>> {
        let driver = self
            .devices
            .get(path)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| AppError::NotFound(path.display().to_string()))?;
        Ok(driver)
    }
}
