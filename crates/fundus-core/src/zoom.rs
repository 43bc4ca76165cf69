//! Digital zoom: a calibrated 1.0x crop and centered windows inside it.

use fundus_hw::{CameraDevice, ControlKey, ControlValue, Controls, Rect, Resolution};
use std::time::Duration;

pub const ZOOM_MIN: f64 = 1.0;
pub const ZOOM_MAX: f64 = 4.0;
pub const INITIAL_ZOOM: f64 = 4.0;

const CALIBRATION_ATTEMPTS: u32 = 5;
const CALIBRATION_BACKOFF: Duration = Duration::from_millis(20);

/// Result of a zoom request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomUpdate {
    /// Requested factor after clamping. This is what the UI shows.
    pub factor: f64,
    /// `base_width / crop_width` of the computed window.
    pub effective: f64,
    pub crop: Option<Rect>,
    /// False if the device rejected the crop or no baseline exists yet.
    pub applied: bool,
}

pub struct ZoomController {
    zoom_factor: f64,
    base_crop: Option<Rect>,
    current_crop: Option<Rect>,
}

impl Default for ZoomController {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoomController {
    pub fn new() -> Self {
        Self {
            zoom_factor: INITIAL_ZOOM,
            base_crop: None,
            current_crop: None,
        }
    }

    pub fn factor(&self) -> f64 {
        self.zoom_factor
    }

    pub fn base_crop(&self) -> Option<Rect> {
        self.base_crop
    }

    pub fn current_crop(&self) -> Option<Rect> {
        self.current_crop
    }

    /// Read the device's current crop as the 1.0x baseline.
    ///
    /// Must run once per preview session, right after `start()`. Falls back
    /// to the full `fallback` frame if the sensor never reports a crop.
    pub fn calibrate(&mut self, camera: &mut dyn CameraDevice, fallback: Resolution) -> Rect {
        for attempt in 1..=CALIBRATION_ATTEMPTS {
            match camera.read_metadata() {
                Ok(metadata) => {
                    let crop = metadata
                        .get(&ControlKey::ScalerCrop)
                        .and_then(ControlValue::as_rect)
                        .filter(|r| !r.is_empty());
                    if let Some(crop) = crop {
                        tracing::info!(?crop, attempt, "zoom baseline calibrated");
                        return self.set_baseline(crop);
                    }
                    tracing::debug!(attempt, "no crop in metadata yet");
                }
                Err(e) => tracing::debug!(attempt, error = %e, "metadata read failed"),
            }
            if attempt < CALIBRATION_ATTEMPTS {
                std::thread::sleep(CALIBRATION_BACKOFF * attempt);
            }
        }

        let crop = Rect::full(fallback);
        tracing::warn!(
            ?crop,
            attempts = CALIBRATION_ATTEMPTS,
            "sensor never reported a crop; using full frame as zoom baseline"
        );
        self.set_baseline(crop)
    }

    fn set_baseline(&mut self, crop: Rect) -> Rect {
        self.base_crop = Some(crop);
        self.current_crop = Some(crop);
        crop
    }

    /// Forget the baseline. Called when preview stops.
    pub fn invalidate(&mut self) {
        self.base_crop = None;
        self.current_crop = None;
    }

    /// Change the zoom by `delta` and apply the resulting crop.
    pub fn set_zoom(&mut self, camera: &mut dyn CameraDevice, delta: f64) -> ZoomUpdate {
        self.set_factor(camera, self.zoom_factor + delta)
    }

    /// Set an absolute zoom factor and apply the resulting crop.
    pub fn set_factor(&mut self, camera: &mut dyn CameraDevice, factor: f64) -> ZoomUpdate {
        self.zoom_factor = clamp_zoom(factor);

        let Some(base) = self.base_crop else {
            tracing::debug!(factor = self.zoom_factor, "zoom stored; no baseline yet");
            return ZoomUpdate {
                factor: self.zoom_factor,
                effective: self.zoom_factor,
                crop: None,
                applied: false,
            };
        };

        let crop = crop_for(base, self.zoom_factor);
        let effective = base.width as f64 / crop.width as f64;
        let applied = match camera.set_controls(&Controls::from([(
            ControlKey::ScalerCrop,
            ControlValue::Rect(crop),
        )])) {
            Ok(()) => {
                self.current_crop = Some(crop);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, ?crop, "failed to apply zoom crop");
                false
            }
        };

        tracing::debug!(factor = self.zoom_factor, effective, ?crop, applied, "zoom");
        ZoomUpdate {
            factor: self.zoom_factor,
            effective,
            crop: Some(crop),
            applied,
        }
    }

    /// Effective zoom reported by a metadata crop, relative to the baseline.
    pub fn effective_from(&self, metadata: &Controls) -> Option<f64> {
        let base = self.base_crop?;
        let crop = metadata
            .get(&ControlKey::ScalerCrop)
            .and_then(ControlValue::as_rect)
            .filter(|r| r.width > 0)?;
        Some(base.width as f64 / crop.width as f64)
    }

    pub fn readout(&self) -> String {
        format!("{:.1}x", self.zoom_factor)
    }
}

pub fn clamp_zoom(factor: f64) -> f64 {
    if factor.is_nan() {
        return ZOOM_MIN;
    }
    factor.clamp(ZOOM_MIN, ZOOM_MAX)
}

/// Centered window of size `base / factor`, on even pixel boundaries.
pub fn crop_for(base: Rect, factor: f64) -> Rect {
    let factor = clamp_zoom(factor);
    let width = round_even(base.width as f64 / factor).clamp(2, base.width.max(2));
    let height = round_even(base.height as f64 / factor).clamp(2, base.height.max(2));
    let dx = round_even(base.width.saturating_sub(width) as f64 / 2.0);
    let dy = round_even(base.height.saturating_sub(height) as f64 / 2.0);
    Rect::new(base.x + dx, base.y + dy, width, height)
}

fn round_even(value: f64) -> u32 {
    ((value / 2.0).round() as u32) * 2
}
