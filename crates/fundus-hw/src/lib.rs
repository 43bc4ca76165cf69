//! fundus-hw: Hardware abstraction for the fundus camera rig.
//!
//! Provides the camera device trait with a V4L2 backend, GPIO-driven
//! illumination, the embedded rig profile database, and in-memory mocks.

pub mod camera;
pub mod controls;
pub mod frame;
pub mod light;
pub mod mock;
pub mod profiles;

pub use camera::{CameraDevice, CameraError, PixelFormat, V4l2Camera};
pub use controls::{AfMode, ControlKey, ControlValue, Controls, Rect, Resolution};
pub use frame::{Frame, ScalePolicy};
pub use light::{GpioLights, LightChannel, LightDriver, LightError};
