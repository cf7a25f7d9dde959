//! Capture engine: device lifecycle plus the background acquisition thread
//!
//! The engine moves between `Idle` and `Streaming`. While streaming, one OS
//! thread owns the buffer pool and the decoder; `stop` is the only path that
//! joins it and takes both back.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::buffer::{BufferPool, BUFFER_COUNT, MIN_PAYLOAD_SIZE};
use super::controls::ControlRegistry;
use super::decoder::{FrameDecoder, MjpegDecoder};
use super::device::{DeviceDescriptor, DeviceHandle, DeviceOpener};
use super::format::Resolution;
use super::frame::{DecodedFrame, FrameSlot};
use super::v4l2::{V4l2Opener, DEFAULT_DEQUEUE_TIMEOUT};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Default pause after a failed dequeue, requeue or decode
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

const CAPTURE_THREAD_NAME: &str = "camview-capture";

/// Tunables for the acquisition loop
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Back-off after a failed iteration (interrupted by `stop`)
    pub retry_delay: Duration,
    /// Number of driver buffers
    pub buffer_count: u32,
    /// Minimum time between repeated log lines of the same error class
    pub log_interval: Duration,
    /// How long the real driver waits for a filled buffer
    pub dequeue_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            buffer_count: BUFFER_COUNT,
            log_interval: Duration::from_secs(5),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Streaming,
}

/// Capture statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Frames decoded and published
    pub frames_decoded: u64,
    /// Header-only payloads requeued without decoding
    pub small_frames_dropped: u64,
    pub dequeue_errors: u64,
    pub requeue_errors: u64,
    pub decode_errors: u64,
    /// Current FPS (calculated)
    pub current_fps: f32,
    /// Size of the last published frame
    pub last_resolution: Option<Resolution>,
}

/// State shared with the capture thread
struct Shared {
    slot: FrameSlot,
    stats: Mutex<CaptureStats>,
    stop_flag: AtomicBool,
    state: watch::Sender<CaptureState>,
}

/// What the capture thread hands back when it exits
struct WorkerOutput {
    pool: BufferPool,
    decoder: Box<dyn FrameDecoder>,
}

struct EngineInner {
    device: DeviceHandle,
    /// Effective descriptor (negotiated size)
    descriptor: Option<DeviceDescriptor>,
    pool: Option<BufferPool>,
    decoder: Option<Box<dyn FrameDecoder>>,
    worker: Option<JoinHandle<WorkerOutput>>,
}

/// MJPEG capture engine for one device
pub struct CaptureEngine {
    options: EngineOptions,
    inner: Mutex<EngineInner>,
    shared: Arc<Shared>,
}

impl CaptureEngine {
    /// Engine backed by real V4L2 devices
    pub fn new(options: EngineOptions) -> Self {
        let opener = V4l2Opener::new().with_timeout(options.dequeue_timeout);
        Self::with_opener(Arc::new(opener), options)
    }

    pub fn with_opener(opener: Arc<dyn DeviceOpener>, options: EngineOptions) -> Self {
        let (state, _rx) = watch::channel(CaptureState::Idle);
        Self {
            options,
            inner: Mutex::new(EngineInner {
                device: DeviceHandle::new(opener),
                descriptor: None,
                pool: None,
                decoder: None,
                worker: None,
            }),
            shared: Arc::new(Shared {
                slot: FrameSlot::new(),
                stats: Mutex::new(CaptureStats::default()),
                stop_flag: AtomicBool::new(false),
                state,
            }),
        }
    }

    /// Open and configure a device, leaving the engine ready to `start`
    ///
    /// Re-initialising an idle engine releases the previous device first.
    pub fn init(&self, descriptor: DeviceDescriptor) -> Result<DeviceDescriptor> {
        let mut inner = self.inner.lock();
        self.init_locked(&mut inner, descriptor)
    }

    /// Start the acquisition thread; a no-op while already streaming
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner)
    }

    /// Stop the acquisition thread; the device stays configured
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    /// Tear down and rebuild capture with a new descriptor, then stream.
    ///
    /// On failure the engine is left idle with everything released and the
    /// caller must `init` again.
    pub fn change(&self, descriptor: DeviceDescriptor) -> Result<DeviceDescriptor> {
        let mut inner = self.inner.lock();
        info!(
            "Reconfiguring capture: {:?} {} @ {} fps",
            descriptor.device_path, descriptor.resolution, descriptor.fps
        );
        self.stop_locked(&mut inner);
        Self::release(&mut inner);

        let result = self
            .init_locked(&mut inner, descriptor)
            .and_then(|effective| self.start_locked(&mut inner).map(|_| effective));

        result.map_err(|e| {
            error!("Reconfigure failed: {}", e);
            Self::release(&mut inner);
            self.shared.state.send_replace(CaptureState::Idle);
            AppError::Reconfigure(Box::new(e))
        })
    }

    /// Switch to another device node, keeping size and rate
    pub fn set_device(&self, path: impl AsRef<Path>) -> Result<DeviceDescriptor> {
        let mut descriptor = self.descriptor().unwrap_or_default();
        descriptor.device_path = path.as_ref().to_path_buf();
        self.change(descriptor)
    }

    pub fn set_size(&self, resolution: Resolution) -> Result<DeviceDescriptor> {
        let mut descriptor = self.descriptor().unwrap_or_default();
        descriptor.resolution = resolution;
        self.change(descriptor)
    }

    pub fn set_frame_rate(&self, fps: u32) -> Result<DeviceDescriptor> {
        let descriptor = self.descriptor().unwrap_or_default().with_fps(fps);
        self.change(descriptor)
    }

    /// Stop streaming and release the device
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
        Self::release(&mut inner);
        self.shared.slot.clear();
    }

    /// Control operations on the open device
    pub fn controls(&self) -> Result<ControlRegistry> {
        let driver = self.inner.lock().device.driver()?;
        Ok(ControlRegistry::new(driver))
    }

    pub fn get_control(&self, id: u32) -> Result<i32> {
        self.controls()?.get(id)
    }

    /// Write a control; out-of-range values are ignored without error
    pub fn set_control(&self, id: u32, value: i32) -> Result<()> {
        self.controls()?.set(id, value)
    }

    pub fn increment_control(&self, id: u32) -> Result<i32> {
        self.controls()?.increment(id)
    }

    pub fn decrement_control(&self, id: u32) -> Result<i32> {
        self.controls()?.decrement(id)
    }

    pub fn toggle_control(&self, id: u32) -> Result<i32> {
        self.controls()?.toggle(id)
    }

    pub fn reset_control(&self, id: u32) -> Result<i32> {
        self.controls()?.reset(id)
    }

    /// Most recently decoded frame
    pub fn latest_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.shared.slot.latest()
    }

    /// Signalled with the frame sequence after every publish
    pub fn frame_watch(&self) -> watch::Receiver<u64> {
        self.shared.slot.subscribe()
    }

    pub fn state(&self) -> CaptureState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.shared.state.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == CaptureState::Streaming
    }

    /// Effective descriptor of the configured device
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.inner.lock().descriptor.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats.lock().clone()
    }

    fn init_locked(
        &self,
        inner: &mut EngineInner,
        descriptor: DeviceDescriptor,
    ) -> Result<DeviceDescriptor> {
        if inner.worker.is_some() {
            return Err(AppError::InvalidState(
                "cannot init while streaming".to_string(),
            ));
        }
        Self::release(inner);

        match Self::prepare(&mut inner.device, &descriptor, &self.options) {
            Ok((effective, pool, decoder)) => {
                info!(
                    "Capture ready on {:?}: {} MJPEG @ {} fps, {} buffers, decoder {}",
                    effective.device_path,
                    effective.resolution,
                    effective.fps,
                    pool.count(),
                    decoder.name()
                );
                inner.descriptor = Some(effective.clone());
                inner.pool = Some(pool);
                inner.decoder = Some(decoder);
                Ok(effective)
            }
            Err(e) => {
                warn!("Failed to initialise {:?}: {}", descriptor.device_path, e);
                Self::release(inner);
                Err(e)
            }
        }
    }

    fn prepare(
        device: &mut DeviceHandle,
        descriptor: &DeviceDescriptor,
        options: &EngineOptions,
    ) -> Result<(DeviceDescriptor, BufferPool, Box<dyn FrameDecoder>)> {
        device.open(&descriptor.device_path)?;

        let caps = device.query_capabilities()?;
        if !caps.can_capture {
            return Err(AppError::ResourceUnavailable(format!(
                "{} is not a video capture device",
                descriptor.device_path.display()
            )));
        }
        if !caps.can_stream {
            return Err(AppError::ResourceUnavailable(format!(
                "{} does not support streaming i/o",
                descriptor.device_path.display()
            )));
        }

        let resolution =
            device.negotiate_format(descriptor.resolution.width, descriptor.resolution.height)?;
        device.set_frame_rate(descriptor.fps)?;

        let mut pool = BufferPool::new(device.driver()?, options.buffer_count);
        pool.request()?;
        pool.map_all()?;
        pool.enqueue_all()?;

        let decoder: Box<dyn FrameDecoder> = Box::new(MjpegDecoder::new()?);
        let effective = DeviceDescriptor {
            resolution,
            ..descriptor.clone()
        };
        Ok((effective, pool, decoder))
    }

    fn start_locked(&self, inner: &mut EngineInner) -> Result<()> {
        if inner.worker.is_some() {
            debug!("Capture already running");
            return Ok(());
        }
        let expected = inner
            .descriptor
            .as_ref()
            .map(|d| d.resolution)
            .ok_or_else(|| AppError::InvalidState("device not initialised".to_string()))?;
        let (pool, decoder) = match (inner.pool.take(), inner.decoder.take()) {
            (Some(pool), Some(decoder)) => (pool, decoder),
            (pool, decoder) => {
                inner.pool = pool;
                inner.decoder = decoder;
                return Err(AppError::InvalidState(
                    "capture resources missing".to_string(),
                ));
            }
        };

        self.shared.stop_flag.store(false, Ordering::SeqCst);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let shared = self.shared.clone();
        let options = self.options.clone();

        let handle = thread::Builder::new()
            .name(CAPTURE_THREAD_NAME.to_string())
            .spawn(move || run_worker(pool, decoder, expected, shared, options, ready_tx))
            .map_err(|e| {
                // The pool went down with the closure
                Self::release(inner);
                AppError::ResourceUnavailable(format!("Failed to spawn capture thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                inner.worker = Some(handle);
                self.shared.state.send_replace(CaptureState::Streaming);
                info!("Capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Stream on failed: {}", e);
                Self::reclaim(inner, handle);
                Err(e)
            }
            Err(_) => {
                Self::reclaim(inner, handle);
                Err(AppError::StreamFailed(
                    "capture thread exited before stream-on".to_string(),
                ))
            }
        }
    }

    fn stop_locked(&self, inner: &mut EngineInner) {
        let Some(handle) = inner.worker.take() else {
            return;
        };
        info!("Stopping capture");
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        Self::reclaim(inner, handle);

        self.shared.stats.lock().current_fps = 0.0;
        self.shared.state.send_replace(CaptureState::Idle);
        info!("Capture stopped");
    }

    /// Join the capture thread and take back the pool and decoder
    fn reclaim(inner: &mut EngineInner, handle: JoinHandle<WorkerOutput>) {
        match handle.join() {
            Ok(output) => {
                inner.pool = Some(output.pool);
                inner.decoder = Some(output.decoder);
            }
            Err(_) => {
                error!("Capture thread panicked, releasing device");
                Self::release(inner);
            }
        }
    }

    /// Drop the pool, decoder and device in that order
    fn release(inner: &mut EngineInner) {
        inner.pool = None;
        inner.decoder = None;
        inner.descriptor = None;
        inner.device.close();
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the capture thread
fn run_worker(
    mut pool: BufferPool,
    mut decoder: Box<dyn FrameDecoder>,
    expected: Resolution,
    shared: Arc<Shared>,
    options: EngineOptions,
    ready: mpsc::SyncSender<Result<()>>,
) -> WorkerOutput {
    let started = pool.enqueue_all().and_then(|_| pool.stream_on());
    let ok = started.is_ok();
    // start() is blocked on this; it cannot have gone away
    let _ = ready.send(started);
    if !ok {
        return WorkerOutput { pool, decoder };
    }

    acquisition_loop(&mut pool, decoder.as_mut(), expected, &shared, &options);

    if let Err(e) = pool.stream_off() {
        warn!("Stream off failed: {}", e);
    }
    WorkerOutput { pool, decoder }
}

/// Re-arm the throttle for `key` after a success, noting the recovery
fn note_recovery(throttler: &LogThrottler, key: &str) -> bool {
    let recovered = throttler.clear(key);
    if recovered {
        info!("Capture recovered ({} ok again)", key);
    }
    recovered
}

/// Interruptible sleep between failed iterations
fn back_off(shared: &Shared, delay: Duration) {
    if !shared.stop_flag.load(Ordering::SeqCst) {
        thread::park_timeout(delay);
    }
}

fn acquisition_loop(
    pool: &mut BufferPool,
    decoder: &mut dyn FrameDecoder,
    expected: Resolution,
    shared: &Shared,
    options: &EngineOptions,
) {
    let throttler = LogThrottler::new(options.log_interval);
    let mut scratch = Vec::new();

    // FPS calculation variables
    let mut fps_frame_count = 0u64;
    let mut fps_window_start = Instant::now();
    let fps_window_duration = Duration::from_secs(1);

    while !shared.stop_flag.load(Ordering::SeqCst) {
        let filled = match pool.dequeue_one() {
            Ok(filled) => filled,
            Err(e) => {
                shared.stats.lock().dequeue_errors += 1;
                warn_throttled!(throttler, "dequeue", "Capture error: {}", e);
                back_off(shared, options.retry_delay);
                continue;
            }
        };
        note_recovery(&throttler, "dequeue");

        if filled.bytes_used <= MIN_PAYLOAD_SIZE {
            trace!(
                "Dropping header-only frame: {} bytes in buffer {}",
                filled.bytes_used,
                filled.index
            );
            shared.stats.lock().small_frames_dropped += 1;
            if let Err(e) = pool.requeue(filled.index) {
                shared.stats.lock().requeue_errors += 1;
                error_throttled!(throttler, "requeue", "{}", e);
                back_off(shared, options.retry_delay);
            }
            continue;
        }

        let copied = pool.read_payload(&filled, &mut scratch);
        if let Err(e) = pool.requeue(filled.index) {
            shared.stats.lock().requeue_errors += 1;
            error_throttled!(throttler, "requeue", "{}", e);
            back_off(shared, options.retry_delay);
            continue;
        }
        note_recovery(&throttler, "requeue");
        if let Err(e) = copied {
            error_throttled!(throttler, "payload", "{}", e);
            continue;
        }

        let frame = match decoder.decode(&scratch, expected) {
            Ok(frame) => {
                note_recovery(&throttler, "decode");
                frame.clone()
            }
            Err(e) => {
                shared.stats.lock().decode_errors += 1;
                warn_throttled!(throttler, "decode", "Dropping frame: {}", e);
                back_off(shared, options.retry_delay);
                continue;
            }
        };

        let resolution = frame.resolution;
        let sequence = shared.slot.publish(frame);
        trace!("Published frame {} ({})", sequence, resolution);

        let mut stats = shared.stats.lock();
        stats.frames_decoded += 1;
        stats.last_resolution = Some(resolution);

        fps_frame_count += 1;
        let elapsed = fps_window_start.elapsed();
        if elapsed >= fps_window_duration {
            stats.current_fps = (fps_frame_count as f32 / elapsed.as_secs_f32()).max(0.0);
            fps_frame_count = 0;
            fps_window_start = Instant::now();
        } else if elapsed.as_millis() > 100 && fps_frame_count > 0 {
            // Partial estimate once there is 100ms of data
            stats.current_fps = (fps_frame_count as f32 / elapsed.as_secs_f32()).max(0.0);
        }
    }
}
