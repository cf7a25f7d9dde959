use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::video::{ControlName, DeviceDescriptor, EngineOptions, PowerLineFrequency, Resolution};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub video: VideoConfig,
    /// Capture loop tuning
    pub capture: CaptureConfig,
    /// Control values applied after the device is opened
    pub controls: ControlsConfig,
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: PathBuf,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 800,
            height: 600,
            fps: 30,
        }
    }
}

impl VideoConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Capture loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pause after a failed capture iteration, in milliseconds
    pub retry_delay_ms: u64,
    /// Minimum seconds between repeats of the same error log line
    pub log_interval_secs: u64,
    /// Seconds between statistics reports (0 disables)
    pub stats_interval_secs: u64,
    /// Wait for a filled buffer before a dequeue counts as failed, in milliseconds
    pub dequeue_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            log_interval_secs: 5,
            stats_interval_secs: 5,
            dequeue_timeout_ms: 1000,
        }
    }
}

/// Startup control values
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlsConfig {
    /// Control name -> value, e.g. `{"brightness": 10}`
    pub values: BTreeMap<String, i32>,
    /// Power line frequency filter: off, 50hz, 60hz or auto
    pub power_line_frequency: Option<String>,
}

impl AppConfig {
    /// Check the configuration for values the engine cannot use
    pub fn validate(&self) -> Result<()> {
        let resolution = self.video.resolution();
        if !resolution.is_valid() {
            return Err(AppError::Config(format!(
                "Invalid resolution {}",
                resolution
            )));
        }
        if self.video.fps == 0 {
            return Err(AppError::Config("fps must be greater than 0".to_string()));
        }
        if self.video.device.as_os_str().is_empty() {
            return Err(AppError::Config("device path is empty".to_string()));
        }
        if self.capture.retry_delay_ms == 0 {
            return Err(AppError::Config(
                "retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.capture.dequeue_timeout_ms == 0 {
            return Err(AppError::Config(
                "dequeue_timeout_ms must be greater than 0".to_string(),
            ));
        }
        for name in self.controls.values.keys() {
            name.parse::<ControlName>().map_err(AppError::Config)?;
        }
        self.power_line_frequency()?;
        Ok(())
    }

    /// Device descriptor requested by this configuration
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::for_device(&self.video.device)
            .with_resolution(self.video.width, self.video.height)
            .with_fps(self.video.fps)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            retry_delay: Duration::from_millis(self.capture.retry_delay_ms),
            log_interval: Duration::from_secs(self.capture.log_interval_secs),
            dequeue_timeout: Duration::from_millis(self.capture.dequeue_timeout_ms),
            ..Default::default()
        }
    }

    /// Startup control values with names resolved
    pub fn control_values(&self) -> Result<Vec<(ControlName, i32)>> {
        self.controls
            .values
            .iter()
            .map(|(name, value)| {
                let control = name.parse::<ControlName>().map_err(AppError::Config)?;
                Ok((control, *value))
            })
            .collect()
    }

    pub fn power_line_frequency(&self) -> Result<Option<PowerLineFrequency>> {
        self.controls
            .power_line_frequency
            .as_deref()
            .map(|s| s.parse().map_err(AppError::Config))
            .transpose()
    }
}
