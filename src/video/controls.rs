//! Device control resolution and composite control operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::device::VideoDriver;
use crate::error::{AppError, Result};

/// Well-known V4L2 control ids
pub mod cid {
    pub const BRIGHTNESS: u32 = 0x0098_0900;
    pub const CONTRAST: u32 = 0x0098_0901;
    pub const SATURATION: u32 = 0x0098_0902;
    pub const HUE: u32 = 0x0098_0903;
    pub const AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
    pub const GAMMA: u32 = 0x0098_0910;
    pub const GAIN: u32 = 0x0098_0913;
    pub const POWER_LINE_FREQUENCY: u32 = 0x0098_0918;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = 0x0098_091a;
    pub const SHARPNESS: u32 = 0x0098_091b;
    pub const BACKLIGHT_COMPENSATION: u32 = 0x0098_091c;
    pub const EXPOSURE_AUTO: u32 = 0x009a_0901;
    pub const EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
    pub const FOCUS_ABSOLUTE: u32 = 0x009a_090a;
    pub const FOCUS_AUTO: u32 = 0x009a_090c;
    pub const ZOOM_ABSOLUTE: u32 = 0x009a_090d;
}

// videodev2.h
const CTRL_TYPE_INTEGER: u32 = 1;
const CTRL_TYPE_BOOLEAN: u32 = 2;
const CTRL_FLAG_DISABLED: u32 = 0x0001;

/// How a control can be driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Boolean,
    Integer,
    Unsupported,
    Disabled,
}

impl ControlKind {
    /// Classify a raw V4L2 control type and flag word
    pub fn classify(ctrl_type: u32, flags: u32) -> Self {
        if flags & CTRL_FLAG_DISABLED != 0 {
            return ControlKind::Disabled;
        }
        match ctrl_type {
            CTRL_TYPE_BOOLEAN => ControlKind::Boolean,
            CTRL_TYPE_INTEGER => ControlKind::Integer,
            _ => ControlKind::Unsupported,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, ControlKind::Boolean | ControlKind::Integer)
    }
}

/// Result of a control query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDescriptor {
    pub id: u32,
    pub name: String,
    pub kind: ControlKind,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default: i32,
}

impl ControlDescriptor {
    pub fn contains(&self, value: i32) -> bool {
        value >= self.minimum && value <= self.maximum
    }

    /// Step used by increment/decrement (never zero)
    fn effective_step(&self) -> i64 {
        (self.step as i64).max(1)
    }
}

/// Power line frequency filter modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerLineFrequency {
    Disabled = 0,
    Hz50 = 1,
    Hz60 = 2,
    Auto = 3,
}

impl std::str::FromStr for PowerLineFrequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "disabled" | "0" => Ok(PowerLineFrequency::Disabled),
            "50" | "50hz" => Ok(PowerLineFrequency::Hz50),
            "60" | "60hz" => Ok(PowerLineFrequency::Hz60),
            "auto" => Ok(PowerLineFrequency::Auto),
            _ => Err(format!("Unknown power line frequency: {}", s)),
        }
    }
}

/// Named controls accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlName {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    Gamma,
    Gain,
    Sharpness,
    BacklightCompensation,
    AutoWhiteBalance,
    WhiteBalanceTemperature,
    ExposureAuto,
    Exposure,
    FocusAuto,
    Focus,
    Zoom,
    PowerLineFrequency,
}

impl ControlName {
    pub const ALL: [ControlName; 16] = [
        ControlName::Brightness,
        ControlName::Contrast,
        ControlName::Saturation,
        ControlName::Hue,
        ControlName::Gamma,
        ControlName::Gain,
        ControlName::Sharpness,
        ControlName::BacklightCompensation,
        ControlName::AutoWhiteBalance,
        ControlName::WhiteBalanceTemperature,
        ControlName::ExposureAuto,
        ControlName::Exposure,
        ControlName::FocusAuto,
        ControlName::Focus,
        ControlName::Zoom,
        ControlName::PowerLineFrequency,
    ];

    pub fn id(&self) -> u32 {
        match self {
            ControlName::Brightness => cid::BRIGHTNESS,
            ControlName::Contrast => cid::CONTRAST,
            ControlName::Saturation => cid::SATURATION,
            ControlName::Hue => cid::HUE,
            ControlName::Gamma => cid::GAMMA,
            ControlName::Gain => cid::GAIN,
            ControlName::Sharpness => cid::SHARPNESS,
            ControlName::BacklightCompensation => cid::BACKLIGHT_COMPENSATION,
            ControlName::AutoWhiteBalance => cid::AUTO_WHITE_BALANCE,
            ControlName::WhiteBalanceTemperature => cid::WHITE_BALANCE_TEMPERATURE,
            ControlName::ExposureAuto => cid::EXPOSURE_AUTO,
            ControlName::Exposure => cid::EXPOSURE_ABSOLUTE,
            ControlName::FocusAuto => cid::FOCUS_AUTO,
            ControlName::Focus => cid::FOCUS_ABSOLUTE,
            ControlName::Zoom => cid::ZOOM_ABSOLUTE,
            ControlName::PowerLineFrequency => cid::POWER_LINE_FREQUENCY,
        }
    }
}

impl std::str::FromStr for ControlName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let name = s.to_lowercase().replace(['-', ' '], "_");
        match name.as_str() {
            "brightness" => Ok(ControlName::Brightness),
            "contrast" => Ok(ControlName::Contrast),
            "saturation" => Ok(ControlName::Saturation),
            "hue" => Ok(ControlName::Hue),
            "gamma" => Ok(ControlName::Gamma),
            "gain" => Ok(ControlName::Gain),
            "sharpness" => Ok(ControlName::Sharpness),
            "backlight" | "backlight_compensation" => Ok(ControlName::BacklightCompensation),
            "awb" | "auto_white_balance" => Ok(ControlName::AutoWhiteBalance),
            "white_balance" | "white_balance_temperature" => {
                Ok(ControlName::WhiteBalanceTemperature)
            }
            "exposure_auto" => Ok(ControlName::ExposureAuto),
            "exposure" => Ok(ControlName::Exposure),
            "focus_auto" => Ok(ControlName::FocusAuto),
            "focus" => Ok(ControlName::Focus),
            "zoom" => Ok(ControlName::Zoom),
            "power_line_frequency" | "plf" => Ok(ControlName::PowerLineFrequency),
            _ => Err(format!("Unknown control: {}", s)),
        }
    }
}

impl fmt::Display for ControlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Control operations against one open device
///
/// Descriptors are re-queried on every call because another process may
/// change control state underneath us.
#[derive(Clone)]
pub struct ControlRegistry {
    driver: Arc<dyn VideoDriver>,
}

impl ControlRegistry {
    pub fn new(driver: Arc<dyn VideoDriver>) -> Self {
        Self { driver }
    }

    /// Query a control's kind and range
    pub fn descriptor(&self, id: u32) -> Result<ControlDescriptor> {
        self.driver.query_control(id)
    }

    /// Descriptor of a usable (boolean or integer) control
    fn resolve(&self, id: u32) -> Result<ControlDescriptor> {
        match self.descriptor(id) {
            Ok(desc) if desc.kind.is_usable() => Ok(desc),
            Ok(desc) => {
                debug!("Control {} ({:#x}) is {:?}", desc.name, id, desc.kind);
                Err(AppError::ControlUnsupported(id))
            }
            Err(e) => {
                debug!("Control {:#x} query failed: {}", id, e);
                Err(AppError::ControlUnsupported(id))
            }
        }
    }

    pub fn get(&self, id: u32) -> Result<i32> {
        let desc = self.descriptor(id)?;
        match desc.kind {
            ControlKind::Disabled => Err(AppError::ControlDisabled(id)),
            ControlKind::Unsupported => Err(AppError::ControlUnsupported(id)),
            ControlKind::Boolean | ControlKind::Integer => self.driver.read_control(id),
        }
    }

    /// Write a control value.
    ///
    /// Out-of-range values are dropped without touching the device and the
    /// call still succeeds. Use [`ControlRegistry::set_strict`] to get an
    /// error instead.
    pub fn set(&self, id: u32, value: i32) -> Result<()> {
        match self.set_strict(id, value) {
            Err(AppError::ControlOutOfRange { min, max, .. }) => {
                debug!(
                    "Ignoring out-of-range value {} for control {:#x} [{}, {}]",
                    value, id, min, max
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Write a control value, failing if it is outside [min, max]
    pub fn set_strict(&self, id: u32, value: i32) -> Result<()> {
        let desc = self.resolve(id)?;
        if !desc.contains(value) {
            return Err(AppError::ControlOutOfRange {
                id,
                value,
                min: desc.minimum,
                max: desc.maximum,
            });
        }
        self.driver.write_control(id, value)
    }

    /// Raise a control by one step; at the top of the range this is a no-op
    pub fn increment(&self, id: u32) -> Result<i32> {
        let desc = self.resolve(id)?;
        let current = self.driver.read_control(id)?;
        let next = current as i64 + desc.effective_step();
        if next > desc.maximum as i64 {
            debug!("Control {} already at max value {}", desc.name, desc.maximum);
            return Ok(current);
        }
        let next = next as i32;
        self.driver.write_control(id, next)?;
        info!("Control {} set to {}", desc.name, next);
        Ok(next)
    }

    /// Lower a control by one step; at the bottom of the range this is a no-op
    pub fn decrement(&self, id: u32) -> Result<i32> {
        let desc = self.resolve(id)?;
        let current = self.driver.read_control(id)?;
        let next = current as i64 - desc.effective_step();
        if next < desc.minimum as i64 {
            debug!("Control {} already at min value {}", desc.name, desc.minimum);
            return Ok(current);
        }
        let next = next as i32;
        self.driver.write_control(id, next)?;
        info!("Control {} set to {}", desc.name, next);
        Ok(next)
    }

    /// Flip a boolean control
    pub fn toggle(&self, id: u32) -> Result<i32> {
        let desc = self.resolve(id)?;
        if desc.kind != ControlKind::Boolean {
            return Err(AppError::ControlWrongKind(id));
        }
        let next = if self.driver.read_control(id)? == 0 { 1 } else { 0 };
        self.driver.write_control(id, next)?;
        info!("Control {} toggled to {}", desc.name, next);
        Ok(next)
    }

    /// Restore the driver default; returns the value written
    pub fn reset(&self, id: u32) -> Result<i32> {
        let desc = self.resolve(id)?;
        self.driver.write_control(id, desc.default)?;
        info!("Control {} reset to {}", desc.name, desc.default);
        Ok(desc.default)
    }

    pub fn set_power_line_frequency(&self, mode: PowerLineFrequency) -> Result<()> {
        self.set_strict(cid::POWER_LINE_FREQUENCY, mode as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::mock::MockDriver;

    fn registry() -> (Arc<MockDriver>, ControlRegistry) {
        let driver = Arc::new(MockDriver::new());
        let registry = ControlRegistry::new(driver.clone());
        (driver, registry)
    }

    #[test]
    fn test_classify() {
        assert_eq!(ControlKind::classify(1, 0), ControlKind::Integer);
        assert_eq!(ControlKind::classify(2, 0), ControlKind::Boolean);
        assert_eq!(ControlKind::classify(3, 0), ControlKind::Unsupported);
        assert_eq!(ControlKind::classify(1, 0x0001), ControlKind::Disabled);
        // Flags other than DISABLED do not change the kind
        assert_eq!(ControlKind::classify(1, 0x0002), ControlKind::Integer);
    }

    #[test]
    fn test_increment_at_max_is_noop() {
        let (driver, controls) = registry();
        driver.add_control(cid::BRIGHTNESS, ControlKind::Integer, 0, 10, 2, 5, 10);

        assert_eq!(controls.increment(cid::BRIGHTNESS).unwrap(), 10);
        assert!(driver.control_writes().is_empty());

        driver.add_control(cid::CONTRAST, ControlKind::Integer, 0, 10, 2, 5, 7);
        assert_eq!(controls.increment(cid::CONTRAST).unwrap(), 9);
        assert_eq!(controls.increment(cid::CONTRAST).unwrap(), 9);
        assert_eq!(driver.control_writes(), vec![(cid::CONTRAST, 9)]);
    }

    #[test]
    fn test_decrement_at_min_is_noop() {
        let (driver, controls) = registry();
        driver.add_control(cid::GAIN, ControlKind::Integer, -4, 4, 4, 0, -4);

        assert_eq!(controls.decrement(cid::GAIN).unwrap(), -4);
        assert!(driver.control_writes().is_empty());

        driver.set_control_value(cid::GAIN, 4);
        assert_eq!(controls.decrement(cid::GAIN).unwrap(), 0);
        assert_eq!(controls.decrement(cid::GAIN).unwrap(), -4);
        assert_eq!(driver.control_value(cid::GAIN), Some(-4));
    }

    #[test]
    fn test_zero_step_moves_by_one() {
        let (driver, controls) = registry();
        driver.add_control(cid::HUE, ControlKind::Integer, 0, 3, 0, 0, 1);
        assert_eq!(controls.increment(cid::HUE).unwrap(), 2);
    }

    #[test]
    fn test_toggle() {
        let (driver, controls) = registry();
        driver.add_control(cid::AUTO_WHITE_BALANCE, ControlKind::Boolean, 0, 1, 1, 1, 1);
        driver.add_control(cid::SHARPNESS, ControlKind::Integer, 0, 7, 1, 3, 3);

        assert_eq!(controls.toggle(cid::AUTO_WHITE_BALANCE).unwrap(), 0);
        assert_eq!(controls.toggle(cid::AUTO_WHITE_BALANCE).unwrap(), 1);
        assert!(matches!(
            controls.toggle(cid::SHARPNESS),
            Err(AppError::ControlWrongKind(id)) if id == cid::SHARPNESS
        ));
        assert_eq!(driver.control_value(cid::SHARPNESS), Some(3));
    }

    #[test]
    fn test_reset_writes_default() {
        let (driver, controls) = registry();
        driver.add_control(cid::SATURATION, ControlKind::Integer, 0, 100, 1, 64, 12);
        assert_eq!(controls.reset(cid::SATURATION).unwrap(), 64);
        assert_eq!(driver.control_value(cid::SATURATION), Some(64));
    }

    #[test]
    fn test_unusable_controls_are_unsupported() {
        let (driver, controls) = registry();
        driver.add_control(cid::ZOOM_ABSOLUTE, ControlKind::Disabled, 0, 10, 1, 0, 0);
        driver.add_control(cid::EXPOSURE_AUTO, ControlKind::Unsupported, 0, 3, 1, 3, 3);

        for id in [cid::ZOOM_ABSOLUTE, cid::EXPOSURE_AUTO, cid::FOCUS_ABSOLUTE] {
            assert!(matches!(
                controls.increment(id),
                Err(AppError::ControlUnsupported(_))
            ));
            assert!(matches!(
                controls.decrement(id),
                Err(AppError::ControlUnsupported(_))
            ));
            assert!(matches!(
                controls.toggle(id),
                Err(AppError::ControlUnsupported(_))
            ));
            assert!(matches!(
                controls.reset(id),
                Err(AppError::ControlUnsupported(_))
            ));
        }

        assert!(matches!(
            controls.get(cid::ZOOM_ABSOLUTE),
            Err(AppError::ControlDisabled(_))
        ));
        assert!(matches!(
            controls.get(cid::FOCUS_ABSOLUTE),
            Err(AppError::ControlQuery { .. })
        ));
    }

    #[test]
    fn test_out_of_range_set_is_silent_noop() {
        let (driver, controls) = registry();
        driver.add_control(cid::BRIGHTNESS, ControlKind::Integer, -64, 64, 1, 0, 10);

        controls.set(cid::BRIGHTNESS, -65).unwrap();
        assert_eq!(controls.get(cid::BRIGHTNESS).unwrap(), 10);
        assert!(driver.control_writes().is_empty());

        assert!(matches!(
            controls.set_strict(cid::BRIGHTNESS, 65),
            Err(AppError::ControlOutOfRange { min: -64, max: 64, .. })
        ));

        controls.set(cid::BRIGHTNESS, 20).unwrap();
        assert_eq!(controls.get(cid::BRIGHTNESS).unwrap(), 20);
    }

    #[test]
    fn test_power_line_frequency() {
        let (driver, controls) = registry();
        driver.add_control(cid::POWER_LINE_FREQUENCY, ControlKind::Integer, 0, 2, 1, 1, 1);

        controls
            .set_power_line_frequency(PowerLineFrequency::Hz60)
            .unwrap();
        assert_eq!(driver.control_value(cid::POWER_LINE_FREQUENCY), Some(2));
        assert!(controls
            .set_power_line_frequency(PowerLineFrequency::Auto)
            .is_err());
        assert_eq!("50hz".parse::<PowerLineFrequency>(), Ok(PowerLineFrequency::Hz50));
    }

    #[test]
    fn test_control_name_parse() {
        assert_eq!("Brightness".parse::<ControlName>(), Ok(ControlName::Brightness));
        assert_eq!("white-balance".parse::<ControlName>(), Ok(ControlName::WhiteBalanceTemperature));
        assert_eq!(ControlName::Zoom.id(), cid::ZOOM_ABSOLUTE);
        assert!("loudness".parse::<ControlName>().is_err());
    }
}
