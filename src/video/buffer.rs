//! Fixed ring of driver-mapped capture buffers

use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::device::{BufferMapping, DequeuedBuffer, VideoDriver};
use crate::error::{AppError, Result};

/// Number of buffers cycled between the driver and the capture thread
pub const BUFFER_COUNT: u32 = 4;

/// Payloads at or below this size are MJPEG header-only frames
pub const MIN_PAYLOAD_SIZE: usize = 0xaf;

/// Ownership state of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Not mapped into process memory
    Unmapped,
    /// Mapped, owned by us, not handed to the driver
    Free,
    /// Owned by the driver
    Queued,
    /// Dequeued, awaiting requeue
    Filled,
}

/// Per-state buffer counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounts {
    pub unmapped: u32,
    pub free: u32,
    pub queued: u32,
    pub filled: u32,
}

impl BufferCounts {
    pub fn total(&self) -> u32 {
        self.unmapped + self.free + self.queued + self.filled
    }
}

struct Slot {
    state: BufferState,
    mapping: Option<Box<dyn BufferMapping>>,
}

/// Buffer ring for one open device
pub struct BufferPool {
    driver: Arc<dyn VideoDriver>,
    count: u32,
    slots: Vec<Slot>,
    streaming: bool,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("device", &self.driver.path())
            .field("count", &self.count)
            .field("counts", &self.counts())
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl BufferPool {
    pub fn new(driver: Arc<dyn VideoDriver>, count: u32) -> Self {
        Self {
            driver,
            count,
            slots: Vec::new(),
            streaming: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn counts(&self) -> BufferCounts {
        let mut counts = BufferCounts::default();
        for slot in &self.slots {
            match slot.state {
                BufferState::Unmapped => counts.unmapped += 1,
                BufferState::Free => counts.free += 1,
                BufferState::Queued => counts.queued += 1,
                BufferState::Filled => counts.filled += 1,
            }
        }
        counts
    }

    /// Ask the driver for the pool's buffers
    pub fn request(&mut self) -> Result<()> {
        if self.slots.iter().any(|s| s.mapping.is_some()) {
            return Err(AppError::InvalidState(
                "buffers are still mapped".to_string(),
            ));
        }

        let granted = self.driver.request_buffers(self.count)?;
        if granted < self.count {
            return Err(AppError::AllocationFailed(format!(
                "requested {} buffers, driver granted {}",
                self.count, granted
            )));
        }
        if granted > self.count {
            debug!(
                "Driver granted {} buffers, using the first {}",
                granted, self.count
            );
        }

        self.slots = (0..self.count)
            .map(|_| Slot {
                state: BufferState::Unmapped,
                mapping: None,
            })
            .collect();
        Ok(())
    }

    /// Map every buffer; on failure the already-mapped ones are released
    pub fn map_all(&mut self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(AppError::InvalidState(
                "buffers have not been requested".to_string(),
            ));
        }

        for index in 0..self.slots.len() {
            if self.slots[index].mapping.is_some() {
                continue;
            }
            match self.driver.map_buffer(index as u32) {
                Ok(mapping) => {
                    trace!("Mapped buffer {} ({} bytes)", index, mapping.len());
                    let slot = &mut self.slots[index];
                    slot.mapping = Some(mapping);
                    slot.state = BufferState::Free;
                }
                Err(e) => {
                    for slot in self.slots[..index].iter_mut().rev() {
                        if let Some(mapping) = slot.mapping.take() {
                            if let Err(unmap_err) = mapping.unmap() {
                                warn!("Rollback unmap failed: {}", unmap_err);
                            }
                        }
                        slot.state = BufferState::Unmapped;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Hand every free buffer to the driver
    pub fn enqueue_all(&mut self) -> Result<()> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.state {
                BufferState::Free => {
                    self.driver.queue_buffer(index as u32)?;
                    slot.state = BufferState::Queued;
                }
                BufferState::Queued => {}
                state => {
                    return Err(AppError::QueueFailed {
                        index: index as u32,
                        reason: format!("buffer is {:?}", state),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn stream_on(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        if self.slots.is_empty() || self.counts().queued != self.count {
            return Err(AppError::StreamFailed(
                "all buffers must be queued before stream-on".to_string(),
            ));
        }
        self.driver.stream_on()?;
        self.streaming = true;
        debug!("Stream on {:?}", self.driver.path());
        Ok(())
    }

    /// Stop streaming; the driver drops every queued buffer
    ///
    /// On failure the pool keeps its streaming view of the buffers, matching
    /// what the driver still owns; it must be re-initialised before reuse.
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.driver.stream_off()?;
        self.streaming = false;
        for slot in &mut self.slots {
            if matches!(slot.state, BufferState::Queued | BufferState::Filled) {
                slot.state = BufferState::Free;
            }
        }
        debug!("Stream off {:?}", self.driver.path());
        Ok(())
    }

    /// Block until the driver returns a filled buffer
    pub fn dequeue_one(&mut self) -> Result<DequeuedBuffer> {
        let filled = self.driver.dequeue_buffer()?;
        match self.slots.get_mut(filled.index as usize) {
            Some(slot) if slot.state == BufferState::Queued => {
                slot.state = BufferState::Filled;
                Ok(filled)
            }
            Some(slot) => Err(AppError::DequeueFailed(format!(
                "driver returned buffer {} in state {:?}",
                filled.index, slot.state
            ))),
            None => Err(AppError::DequeueFailed(format!(
                "driver returned unknown buffer {}",
                filled.index
            ))),
        }
    }

    /// Copy the valid bytes of a filled buffer into `dst`
    pub fn read_payload(&self, filled: &DequeuedBuffer, dst: &mut Vec<u8>) -> Result<()> {
        match self.slots.get(filled.index as usize) {
            Some(Slot {
                state: BufferState::Filled,
                mapping: Some(mapping),
            }) => {
                mapping.read_into(filled.bytes_used, dst);
                Ok(())
            }
            _ => Err(AppError::InvalidState(format!(
                "buffer {} is not filled",
                filled.index
            ))),
        }
    }

    /// Return a filled buffer to the driver
    pub fn requeue(&mut self, index: u32) -> Result<()> {
        let slot = match self.slots.get_mut(index as usize) {
            Some(slot) if slot.state == BufferState::Filled => slot,
            Some(slot) => {
                return Err(AppError::RequeueFailed {
                    index,
                    reason: format!("buffer is {:?}", slot.state),
                })
            }
            None => {
                return Err(AppError::RequeueFailed {
                    index,
                    reason: "no such buffer".to_string(),
                })
            }
        };
        self.driver
            .queue_buffer(index)
            .map_err(|e| AppError::RequeueFailed {
                index,
                reason: e.to_string(),
            })?;
        slot.state = BufferState::Queued;
        Ok(())
    }

    /// Unmap every buffer and release them in the driver
    pub fn unmap_all(&mut self) -> Result<()> {
        if self.streaming {
            return Err(AppError::InvalidState(
                "cannot unmap buffers while streaming".to_string(),
            ));
        }

        let mut first_error = None;
        for slot in &mut self.slots {
            if let Some(mapping) = slot.mapping.take() {
                if let Err(e) = mapping.unmap() {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
            slot.state = BufferState::Unmapped;
        }

        if !self.slots.is_empty() {
            self.slots.clear();
            if let Err(e) = self.driver.request_buffers(0) {
                debug!("Failed to release driver buffers: {}", e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            debug!("Stream off during pool drop failed: {}", e);
            self.streaming = false;
        }
        if let Err(e) = self.unmap_all() {
            debug!("Unmap during pool drop failed: {}", e);
        }
    }
}
