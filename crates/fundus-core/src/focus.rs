//! Focus state machine: Manual, ContinuousAuto, or permanently Unavailable.
//!
//! | from \ event   | nudge                          | enable_auto    | pin_for_capture |
//! |----------------|--------------------------------|----------------|-----------------|
//! | Manual         | Manual (position += delta)     | ContinuousAuto | Manual (no-op)  |
//! | ContinuousAuto | Manual (seeded, then += delta) | ContinuousAuto | Manual (pinned) |
//! | Unavailable    | Unavailable (unsupported)      | Unavailable    | Unavailable     |

use crate::error::RigError;
use fundus_hw::controls::{LENS_POSITION_MAX, LENS_POSITION_MIN};
use fundus_hw::{AfMode, CameraDevice, ControlKey, ControlValue, Controls};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

pub const FOCUS_MIN: f64 = LENS_POSITION_MIN;
pub const FOCUS_MAX: f64 = LENS_POSITION_MAX;
pub const INITIAL_FOCUS: f64 = 5.0;

/// Delay before sampling the lens after autofocus is switched on.
pub const AUTO_SAMPLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FocusMode {
    /// The sensor has no lens control. Permanent.
    Unavailable,
    Manual,
    ContinuousAuto,
}

/// Focus state captured before a photo and restored after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusSnapshot {
    pub mode: FocusMode,
    pub position: f64,
}

pub struct FocusController {
    mode: FocusMode,
    position: f64,
    last_observed_auto_position: Option<f64>,
    auto_supported: bool,
}

impl FocusController {
    /// Decide focus capability from the sensor's control list.
    pub fn detect(supported: &BTreeSet<ControlKey>) -> Self {
        let manual = supported.contains(&ControlKey::LensPosition);
        let auto_supported = manual && supported.contains(&ControlKey::AfMode);
        let mode = if manual {
            FocusMode::Manual
        } else {
            FocusMode::Unavailable
        };
        tracing::info!(?mode, auto_supported, "focus capability");
        Self {
            mode,
            position: INITIAL_FOCUS,
            last_observed_auto_position: None,
            auto_supported,
        }
    }

    pub fn mode(&self) -> FocusMode {
        self.mode
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn last_observed_auto_position(&self) -> Option<f64> {
        self.last_observed_auto_position
    }

    pub fn is_available(&self) -> bool {
        self.mode != FocusMode::Unavailable
    }

    pub fn snapshot(&self) -> FocusSnapshot {
        FocusSnapshot {
            mode: self.mode,
            position: self.position,
        }
    }

    /// Switch to continuous autofocus and kick off a scan.
    pub fn enable_auto(&mut self, camera: &mut dyn CameraDevice) -> Result<(), RigError> {
        if self.mode == FocusMode::Unavailable || !self.auto_supported {
            return Err(RigError::CapabilityUnsupported("continuous autofocus"));
        }
        let mut request = Controls::from([(
            ControlKey::AfMode,
            ControlValue::AfMode(AfMode::Continuous),
        )]);
        if camera.supported_controls().contains(&ControlKey::AfTrigger) {
            request.insert(ControlKey::AfTrigger, ControlValue::Trigger);
        }
        camera.set_controls(&request)?;
        self.mode = FocusMode::ContinuousAuto;
        tracing::info!("continuous autofocus enabled");
        Ok(())
    }

    /// Record a live lens position reported while in ContinuousAuto.
    pub fn observe(&mut self, metadata: &Controls) -> Option<f64> {
        if self.mode != FocusMode::ContinuousAuto {
            return None;
        }
        let position = metadata
            .get(&ControlKey::LensPosition)
            .and_then(ControlValue::as_f64)?;
        self.last_observed_auto_position = Some(position);
        tracing::trace!(position, "observed auto lens position");
        Some(position)
    }

    /// Read metadata and observe it. Read failures are logged and ignored.
    pub fn sample(&mut self, camera: &mut dyn CameraDevice) -> Option<f64> {
        match camera.read_metadata() {
            Ok(metadata) => self.observe(&metadata),
            Err(e) => {
                tracing::debug!(error = %e, "lens sample failed");
                None
            }
        }
    }

    /// Leave ContinuousAuto without a jump in lens position.
    ///
    /// The manual baseline is the last auto position the user saw, refreshed
    /// from the sensor one final time.
    pub fn switch_to_manual(&mut self, camera: &mut dyn CameraDevice) -> Result<(), RigError> {
        match self.mode {
            FocusMode::Unavailable => Err(RigError::CapabilityUnsupported("manual focus")),
            FocusMode::Manual => Ok(()),
            FocusMode::ContinuousAuto => {
                self.sample(camera);
                if let Some(observed) = self.last_observed_auto_position {
                    self.position = clamp_focus(observed);
                }
                self.mode = FocusMode::Manual;
                tracing::info!(position = self.position, "autofocus -> manual");
                camera.set_controls(&Controls::from([
                    (ControlKey::AfMode, ControlValue::AfMode(AfMode::Manual)),
                    (ControlKey::LensPosition, ControlValue::Float(self.position)),
                ]))?;
                Ok(())
            }
        }
    }

    /// Move the lens by `delta`, leaving autofocus first if needed.
    pub fn nudge(&mut self, camera: &mut dyn CameraDevice, delta: f64) -> Result<f64, RigError> {
        if self.mode == FocusMode::ContinuousAuto {
            if let Err(e) = self.switch_to_manual(camera) {
                tracing::warn!(error = %e, "switch to manual focus failed; applying nudge anyway");
            }
        }
        if self.mode == FocusMode::Unavailable {
            return Err(RigError::CapabilityUnsupported("manual focus"));
        }
        self.position = clamp_focus(self.position + delta);
        self.apply_position(camera)?;
        Ok(self.position)
    }

    /// Set an absolute manual position, leaving autofocus if needed.
    pub fn set_position(
        &mut self,
        camera: &mut dyn CameraDevice,
        position: f64,
    ) -> Result<f64, RigError> {
        let was_auto = match self.mode {
            FocusMode::Unavailable => return Err(RigError::CapabilityUnsupported("manual focus")),
            FocusMode::Manual => false,
            FocusMode::ContinuousAuto => true,
        };
        self.mode = FocusMode::Manual;
        self.position = clamp_focus(position);
        if was_auto {
            camera.set_controls(&Controls::from([
                (ControlKey::AfMode, ControlValue::AfMode(AfMode::Manual)),
                (ControlKey::LensPosition, ControlValue::Float(self.position)),
            ]))?;
        } else {
            self.apply_position(camera)?;
        }
        Ok(self.position)
    }

    /// Freeze the lens where autofocus currently has it.
    ///
    /// Returns the pinned position, or `None` if focus was not in auto.
    pub fn pin_for_capture(
        &mut self,
        camera: &mut dyn CameraDevice,
    ) -> Result<Option<f64>, RigError> {
        if self.mode != FocusMode::ContinuousAuto {
            return Ok(None);
        }
        let live = self
            .sample(camera)
            .or(self.last_observed_auto_position)
            .unwrap_or(self.position);
        self.position = clamp_focus(live);
        self.mode = FocusMode::Manual;
        camera.set_controls(&Controls::from([
            (ControlKey::AfMode, ControlValue::AfMode(AfMode::Manual)),
            (ControlKey::LensPosition, ControlValue::Float(self.position)),
        ]))?;
        tracing::debug!(position = self.position, "focus pinned for capture");
        Ok(Some(self.position))
    }

    /// Return to the mode and position recorded in `snapshot`.
    pub fn restore(
        &mut self,
        camera: &mut dyn CameraDevice,
        snapshot: FocusSnapshot,
    ) -> Result<(), RigError> {
        match (snapshot.mode, self.mode) {
            (FocusMode::Unavailable, _) | (_, FocusMode::Unavailable) => Ok(()),
            (FocusMode::ContinuousAuto, FocusMode::ContinuousAuto) => Ok(()),
            (FocusMode::ContinuousAuto, FocusMode::Manual) => {
                self.position = snapshot.position;
                camera.set_controls(&Controls::from([(
                    ControlKey::AfMode,
                    ControlValue::AfMode(AfMode::Continuous),
                )]))?;
                self.mode = FocusMode::ContinuousAuto;
                Ok(())
            }
            (FocusMode::Manual, _) => {
                if self.mode == FocusMode::Manual && self.position == snapshot.position {
                    return Ok(());
                }
                self.set_position(camera, snapshot.position).map(|_| ())
            }
        }
    }

    fn apply_position(&self, camera: &mut dyn CameraDevice) -> Result<(), RigError> {
        camera.set_controls(&Controls::from([(
            ControlKey::LensPosition,
            ControlValue::Float(self.position),
        )]))?;
        Ok(())
    }

    /// Short text for the focus readout.
    pub fn readout(&self) -> String {
        match self.mode {
            FocusMode::Unavailable => "unsupported".to_string(),
            FocusMode::Manual => format!("{:.2}", self.position),
            FocusMode::ContinuousAuto => match self.last_observed_auto_position {
                Some(p) => format!("auto {p:.2}"),
                None => "auto".to_string(),
            },
        }
    }
}

pub fn clamp_focus(position: f64) -> f64 {
    if position.is_nan() {
        return FOCUS_MIN;
    }
    position.clamp(FOCUS_MIN, FOCUS_MAX)
}
