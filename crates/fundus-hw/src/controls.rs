//! Sensor control keys, values and geometry shared by every camera backend.

use serde::Serialize;
use std::collections::BTreeMap;

/// Lens position range exposed to callers, in dioptres (0 = infinity).
pub const LENS_POSITION_MIN: f64 = 0.0;
pub const LENS_POSITION_MAX: f64 = 10.0;

/// Output resolution of the sensor pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Rectangle in sensor pixel coordinates: offset plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole frame at the given resolution.
    pub const fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width, resolution.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Center point, in (possibly half-pixel) sensor coordinates.
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// Autofocus algorithm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AfMode {
    Manual,
    Continuous,
}

/// Controls the rig reads or writes on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ControlKey {
    /// Crop window (digital zoom).
    ScalerCrop,
    /// Auto-exposure enable.
    AeEnable,
    /// Auto-white-balance enable.
    AwbEnable,
    AfMode,
    /// One-shot autofocus trigger.
    AfTrigger,
    /// Lens position in dioptres.
    LensPosition,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Float(f64),
    Rect(Rect),
    AfMode(AfMode),
    Trigger,
}

impl ControlValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_rect(&self) -> Option<Rect> {
        match self {
            Self::Rect(r) => Some(*r),
            _ => None,
        }
    }
}

/// A set of control values, used both for writes and for frame metadata.
pub type Controls = BTreeMap<ControlKey, ControlValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_contains() {
        let outer = Rect::new(0, 0, 1280, 720);
        assert!(outer.contains(&Rect::new(480, 270, 320, 180)));
        assert!(!outer.contains(&Rect::new(1200, 0, 100, 10)));
    }

    #[test]
    fn test_rect_center() {
        let r = Rect::new(480, 270, 320, 180);
        assert_eq!(r.center(), (640.0, 360.0));
    }

    #[test]
    fn test_control_value_accessors() {
        assert_eq!(ControlValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ControlValue::Float(3.2).as_bool(), None);
        assert_eq!(ControlValue::AfMode(AfMode::Continuous).as_f64(), None);
    }
}
