//! In-memory camera and lights for bench bring-up and tests.
//!
//! Both mocks are cheap to clone and share their state, so a test can hand
//! one clone to the rig and keep another to inspect or inject failures.

use crate::camera::{CameraDevice, CameraError};
use crate::controls::{
    AfMode, ControlKey, ControlValue, Controls, Rect, Resolution, LENS_POSITION_MAX,
    LENS_POSITION_MIN,
};
use crate::frame::{self, Frame, FrameError};
use crate::light::{LightChannel, LightDriver, LightError};
use image::{Rgb, RgbImage};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Shared state behind a [`MockCamera`].
#[derive(Debug)]
pub struct MockCameraState {
    pub resolution: Resolution,
    pub streaming: bool,
    pub crop: Rect,
    pub ae_enabled: bool,
    pub awb_enabled: bool,
    pub af_mode: AfMode,
    /// Lens position reported in metadata; tests move it to simulate AF.
    pub lens_position: f64,
    pub supported: BTreeSet<ControlKey>,
    /// When false, metadata omits `ScalerCrop`.
    pub report_crop: bool,
    pub fail_controls: bool,
    pub fail_capture: bool,
    pub capture_latency: Duration,
    pub frames_captured: u32,
    pub files: Vec<PathBuf>,
    /// Every successful `set_controls` call, in order.
    pub control_log: Vec<Controls>,
}

impl Default for MockCameraState {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(1280, 720),
            streaming: false,
            crop: Rect::new(0, 0, 1280, 720),
            ae_enabled: true,
            awb_enabled: true,
            af_mode: AfMode::Manual,
            lens_position: 5.0,
            supported: BTreeSet::from([
                ControlKey::ScalerCrop,
                ControlKey::AeEnable,
                ControlKey::AwbEnable,
                ControlKey::AfMode,
                ControlKey::AfTrigger,
                ControlKey::LensPosition,
            ]),
            report_crop: true,
            fail_controls: false,
            fail_capture: false,
            capture_latency: Duration::ZERO,
            frames_captured: 0,
            files: Vec::new(),
            control_log: Vec::new(),
        }
    }
}

/// Camera that renders a flat test frame and remembers every control write.
#[derive(Clone, Default)]
pub struct MockCamera {
    state: Arc<Mutex<MockCameraState>>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fixed-focus sensor: no autofocus, no lens control.
    pub fn fixed_focus() -> Self {
        let camera = Self::new();
        {
            let mut state = camera.state();
            state.supported.remove(&ControlKey::AfMode);
            state.supported.remove(&ControlKey::AfTrigger);
            state.supported.remove(&ControlKey::LensPosition);
        }
        camera
    }

    /// Lock the shared state for inspection or fault injection.
    pub fn state(&self) -> MutexGuard<'_, MockCameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(state: &MockCameraState, width: u32, height: u32) -> RgbImage {
        // Brightness tracks the frame counter so consecutive frames differ.
        let level = (state.frames_captured % 200) as u8 + 30;
        RgbImage::from_pixel(width.max(1), height.max(1), Rgb([level, level / 2, level / 3]))
    }
}

impl CameraDevice for MockCamera {
    fn configure(&mut self, resolution: Resolution) -> Result<Resolution, CameraError> {
        let mut state = self.state();
        state.resolution = resolution;
        state.crop = Rect::full(resolution);
        Ok(resolution)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let mut state = self.state();
        state.crop = Rect::full(state.resolution);
        state.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        self.state().streaming = false;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let mut state = self.state();
        if !state.streaming {
            return Err(CameraError::NotStreaming);
        }
        state.frames_captured += 1;
        let Resolution { width, height } = state.resolution;
        let image = Self::render(&state, width, height);
        Ok(Frame::from_image(image, state.frames_captured))
    }

    fn capture_to_file(&mut self, path: &Path) -> Result<(), CameraError> {
        let latency = {
            let state = self.state();
            if state.fail_capture {
                return Err(CameraError::CaptureFailed("injected capture failure".into()));
            }
            state.capture_latency
        };
        std::thread::sleep(latency);

        let mut state = self.state();
        state.frames_captured += 1;
        // A reduced-size placeholder keeps encoding cheap in tests.
        let image = Self::render(&state, state.crop.width / 8, state.crop.height / 8);
        frame::save_jpeg(&image, path).map_err(|e| match e {
            FrameError::Codec(image::ImageError::IoError(io)) => CameraError::Io(io),
            other => CameraError::Frame(other),
        })?;
        state.files.push(path.to_path_buf());
        Ok(())
    }

    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        let mut state = self.state();
        if state.fail_controls {
            let key = controls.keys().next().copied().unwrap_or(ControlKey::ScalerCrop);
            return Err(CameraError::ControlFailed {
                key,
                reason: "injected control failure".into(),
            });
        }
        for (&key, value) in controls {
            if !state.supported.contains(&key) {
                return Err(CameraError::ControlFailed {
                    key,
                    reason: "not supported by mock sensor".into(),
                });
            }
            match (key, *value) {
                (ControlKey::ScalerCrop, ControlValue::Rect(rect)) => {
                    if !Rect::full(state.resolution).contains(&rect) || rect.is_empty() {
                        return Err(CameraError::ControlFailed {
                            key,
                            reason: format!("crop {rect:?} outside sensor"),
                        });
                    }
                    state.crop = rect;
                }
                (ControlKey::AeEnable, ControlValue::Bool(on)) => state.ae_enabled = on,
                (ControlKey::AwbEnable, ControlValue::Bool(on)) => state.awb_enabled = on,
                (ControlKey::AfMode, ControlValue::AfMode(mode)) => state.af_mode = mode,
                (ControlKey::AfTrigger, ControlValue::Trigger) => {}
                (ControlKey::LensPosition, ControlValue::Float(position)) => {
                    state.lens_position = position.clamp(LENS_POSITION_MIN, LENS_POSITION_MAX);
                }
                (key, value) => {
                    return Err(CameraError::ControlFailed {
                        key,
                        reason: format!("value {value:?} has the wrong type"),
                    });
                }
            }
        }
        state.control_log.push(controls.clone());
        Ok(())
    }

    fn read_metadata(&mut self) -> Result<Controls, CameraError> {
        let state = self.state();
        let mut metadata = Controls::new();
        if state.report_crop {
            metadata.insert(ControlKey::ScalerCrop, ControlValue::Rect(state.crop));
        }
        metadata.insert(ControlKey::AeEnable, ControlValue::Bool(state.ae_enabled));
        metadata.insert(ControlKey::AwbEnable, ControlValue::Bool(state.awb_enabled));
        if state.supported.contains(&ControlKey::AfMode) {
            metadata.insert(ControlKey::AfMode, ControlValue::AfMode(state.af_mode));
        }
        if state.supported.contains(&ControlKey::LensPosition) {
            metadata.insert(
                ControlKey::LensPosition,
                ControlValue::Float(state.lens_position),
            );
        }
        Ok(metadata)
    }

    fn supported_controls(&self) -> BTreeSet<ControlKey> {
        self.state().supported.clone()
    }
}

/// Shared state behind [`MockLights`].
#[derive(Debug, Default)]
pub struct MockLightsState {
    pub infrared: bool,
    pub visible: bool,
    /// Every write, in order.
    pub history: Vec<(LightChannel, bool)>,
    pub fail: bool,
}

impl MockLightsState {
    /// True if the visible channel was ever switched on.
    pub fn visible_ever_on(&self) -> bool {
        self.history
            .iter()
            .any(|&(channel, on)| channel == LightChannel::Visible && on)
    }

    /// True if both channels were ever on at the same time.
    pub fn overlap_seen(&self) -> bool {
        let (mut ir, mut vis) = (false, false);
        for &(channel, on) in &self.history {
            match channel {
                LightChannel::Infrared => ir = on,
                LightChannel::Visible => vis = on,
            }
            if ir && vis {
                return true;
            }
        }
        false
    }
}

/// Lights that record every write.
#[derive(Clone, Default)]
pub struct MockLights {
    state: Arc<Mutex<MockLightsState>>,
}

impl MockLights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockLightsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LightDriver for MockLights {
    fn set(&mut self, channel: LightChannel, on: bool) -> Result<(), LightError> {
        let mut state = self.state();
        if state.fail {
            return Err(LightError::Write {
                channel,
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected light failure"),
            });
        }
        match channel {
            LightChannel::Infrared => state.infrared = on,
            LightChannel::Visible => state.visible = on,
        }
        state.history.push((channel, on));
        Ok(())
    }
}
