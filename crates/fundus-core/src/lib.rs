//! fundus-core: Camera and light control for the fundus rig.
//!
//! Zoom calibration, focus-mode continuity, illumination policy, the
//! single-flight capture sequencer and the live preview loop, all sharing
//! one [`CameraSession`].

pub mod capture;
pub mod error;
pub mod focus;
pub mod illumination;
pub mod preview;
pub mod session;
pub mod zoom;

pub use capture::{CaptureKind, CaptureOutcome, CaptureSequencer};
pub use error::RigError;
pub use focus::{FocusController, FocusMode};
pub use illumination::{IlluminationController, IlluminationState, Phase};
pub use preview::{PreviewLoop, PreviewSink, SharedFrame, TickOutcome};
pub use session::{CameraSession, RigSettings, RigStatus};
pub use zoom::{ZoomController, ZoomUpdate};

/// Step sizes offered for zoom and focus nudges.
pub const STEP_CHOICES: [f64; 4] = [0.1, 0.5, 1.0, 2.5];

/// True if `step` is one of [`STEP_CHOICES`].
pub fn is_step_choice(step: f64) -> bool {
    STEP_CHOICES.iter().any(|&choice| (choice - step).abs() < 1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_choices() {
        assert!(is_step_choice(0.5));
        assert!(is_step_choice(2.5));
        assert!(!is_step_choice(0.3));
        assert!(!is_step_choice(-0.1));
    }
}
