//! Phase-to-light policy for the IR and visible channels.

use fundus_hw::{LightChannel, LightDriver, LightError};
use serde::Serialize;

/// Operating phase of the rig, as far as the lights are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Preview stopped.
    Idle,
    Preview,
    /// Visible flash during a photo.
    CapturePulse,
    /// Flash over; IR comes back only if preview is still live.
    PostPulse { preview_running: bool },
    /// Infrared photo: the visible channel must stay dark.
    InfraredCapture { preview_running: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IlluminationState {
    pub ir_on: bool,
    pub visible_on: bool,
}

impl Phase {
    pub fn outputs(self) -> IlluminationState {
        match self {
            Phase::Idle => IlluminationState {
                ir_on: false,
                visible_on: false,
            },
            Phase::Preview => IlluminationState {
                ir_on: true,
                visible_on: false,
            },
            Phase::CapturePulse => IlluminationState {
                ir_on: false,
                visible_on: true,
            },
            Phase::PostPulse { preview_running } | Phase::InfraredCapture { preview_running } => {
                IlluminationState {
                    ir_on: preview_running,
                    visible_on: false,
                }
            }
        }
    }
}

/// Sole owner of light writes.
#[derive(Default)]
pub struct IlluminationController {
    state: IlluminationState,
}

impl IlluminationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> IlluminationState {
        self.state
    }

    /// Drive the lights to `phase`'s outputs.
    ///
    /// Channels going off are written before channels going on, so the two
    /// are never lit together. `state()` tracks only writes that succeeded.
    pub fn apply(
        &mut self,
        lights: &mut dyn LightDriver,
        phase: Phase,
    ) -> Result<IlluminationState, LightError> {
        let target = phase.outputs();
        let writes = [
            (LightChannel::Infrared, target.ir_on),
            (LightChannel::Visible, target.visible_on),
        ];
        for on in [false, true] {
            for &(channel, wanted) in writes.iter().filter(|(_, wanted)| *wanted == on) {
                lights.set(channel, wanted)?;
                match channel {
                    LightChannel::Infrared => self.state.ir_on = wanted,
                    LightChannel::Visible => self.state.visible_on = wanted,
                }
            }
        }
        tracing::debug!(?phase, ir = target.ir_on, visible = target.visible_on, "illumination");
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundus_hw::mock::MockLights;

    #[test]
    fn test_policy_table() {
        let cases = [
            (Phase::Idle, false, false),
            (Phase::Preview, true, false),
            (Phase::CapturePulse, false, true),
            (Phase::PostPulse { preview_running: true }, true, false),
            (Phase::PostPulse { preview_running: false }, false, false),
            (Phase::InfraredCapture { preview_running: true }, true, false),
        ];
        for (phase, ir_on, visible_on) in cases {
            assert_eq!(
                phase.outputs(),
                IlluminationState { ir_on, visible_on },
                "{phase:?}"
            );
        }
    }

    #[test]
    fn test_off_before_on() {
        let mut lights = MockLights::new();
        let mut illumination = IlluminationController::new();
        illumination.apply(&mut lights, Phase::Preview).unwrap();
        illumination.apply(&mut lights, Phase::CapturePulse).unwrap();
        illumination
            .apply(&mut lights, Phase::PostPulse { preview_running: true })
            .unwrap();
        assert!(!lights.state().overlap_seen(), "IR and visible were lit together");
        assert_eq!(
            lights.state().history[2..4],
            [(LightChannel::Infrared, false), (LightChannel::Visible, true)]
        );
    }

    #[test]
    fn test_failed_write_is_not_recorded() {
        let mut lights = MockLights::new();
        let mut illumination = IlluminationController::new();
        lights.state().fail = true;
        assert!(illumination.apply(&mut lights, Phase::Preview).is_err());
        assert_eq!(illumination.state(), IlluminationState::default());
    }
}
