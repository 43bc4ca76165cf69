//! The one long-lived context shared by every controller.

use crate::error::RigError;
use crate::focus::{FocusController, FocusMode, AUTO_SAMPLE_DELAY, INITIAL_FOCUS};
use crate::illumination::{IlluminationController, IlluminationState, Phase};
use crate::zoom::{ZoomController, ZoomUpdate, INITIAL_ZOOM};
use fundus_hw::{CameraDevice, LightDriver, Resolution};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tokio::sync::watch;

/// Static settings for one rig.
#[derive(Debug, Clone)]
pub struct RigSettings {
    pub resolution: Resolution,
    /// Photos go under `<save_dir>/Fundus/...`.
    pub save_dir: PathBuf,
    /// Total visible-light time per photo; the sensor is read at its midpoint.
    pub visible_window: Duration,
    /// Lock AE/AWB for the duration of the flash.
    pub freeze_exposure: bool,
    pub visible_prefix: String,
    pub infrared_prefix: String,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(1280, 720),
            save_dir: PathBuf::from("."),
            visible_window: Duration::from_secs(1),
            freeze_exposure: true,
            visible_prefix: "fundus".to_string(),
            infrared_prefix: "fundusIR".to_string(),
        }
    }
}

/// Snapshot published to observers after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RigStatus {
    pub preview_running: bool,
    pub capture_in_flight: bool,
    /// Requested zoom, e.g. "4.0x".
    pub zoom: String,
    /// Zoom measured from the sensor's crop, when known.
    pub effective_zoom: Option<f64>,
    pub focus: String,
    pub focus_mode: Option<FocusMode>,
    pub illumination: IlluminationState,
    pub message: String,
    pub last_capture: Option<PathBuf>,
}

/// Everything that touches the device, behind one lock.
pub(crate) struct RigState {
    pub(crate) camera: Box<dyn CameraDevice>,
    pub(crate) lights: Box<dyn LightDriver>,
    pub(crate) resolution: Resolution,
    pub(crate) zoom: ZoomController,
    pub(crate) focus: FocusController,
    pub(crate) illumination: IlluminationController,
    pub(crate) preview_running: bool,
}

pub struct CameraSession {
    settings: RigSettings,
    state: Mutex<RigState>,
    capture_in_flight: AtomicBool,
    /// Bumped on every preview start; a loop from an older run exits.
    preview_epoch: AtomicU64,
    status_tx: watch::Sender<RigStatus>,
}

impl CameraSession {
    /// Take ownership of the hardware and bring it to a known idle state.
    ///
    /// This is the only place where a hardware failure is fatal.
    pub fn new(
        mut camera: Box<dyn CameraDevice>,
        mut lights: Box<dyn LightDriver>,
        settings: RigSettings,
    ) -> Result<Arc<Self>, RigError> {
        let resolution = camera.configure(settings.resolution)?;
        let mut illumination = IlluminationController::new();
        illumination.apply(lights.as_mut(), Phase::Idle)?;
        let focus = FocusController::detect(&camera.supported_controls());

        let state = RigState {
            camera,
            lights,
            resolution,
            zoom: ZoomController::new(),
            focus,
            illumination,
            preview_running: false,
        };
        let (status_tx, _) = watch::channel(RigStatus::default());
        let session = Arc::new(Self {
            settings,
            state: Mutex::new(state),
            capture_in_flight: AtomicBool::new(false),
            preview_epoch: AtomicU64::new(0),
            status_tx,
        });
        {
            let state = session.lock_state();
            session.refresh_status(&state, "ready");
        }
        tracing::info!(?resolution, "camera session ready");
        Ok(session)
    }

    pub fn settings(&self) -> &RigSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> watch::Receiver<RigStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> RigStatus {
        self.status_tx.borrow().clone()
    }

    pub fn is_preview_running(&self) -> bool {
        self.status_tx.borrow().preview_running
    }

    pub fn preview_epoch(&self) -> u64 {
        self.preview_epoch.load(Ordering::Acquire)
    }

    pub fn capture_in_flight(&self) -> bool {
        self.capture_in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock without waiting. `None` while someone else holds the device.
    pub(crate) fn try_lock_state(&self) -> Option<MutexGuard<'_, RigState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Claim the single-flight capture token.
    pub(crate) fn try_begin_capture(self: &Arc<Self>) -> Option<CaptureGuard> {
        self.capture_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.status_tx.send_modify(|s| s.capture_in_flight = true);
        Some(CaptureGuard {
            session: Arc::clone(self),
        })
    }

    pub(crate) fn publish(&self, update: impl FnOnce(&mut RigStatus)) {
        self.status_tx.send_modify(update);
    }

    /// Republish readouts from `state` with a new status message.
    pub(crate) fn refresh_status(&self, state: &RigState, message: impl Into<String>) {
        let message = message.into();
        self.status_tx.send_modify(|s| {
            s.preview_running = state.preview_running;
            s.zoom = state.zoom.readout();
            s.focus = state.focus.readout();
            s.focus_mode = Some(state.focus.mode());
            s.illumination = state.illumination.state();
            s.message = message;
        });
    }

    /// Log an error and put it in the status line.
    fn report(&self, state: &RigState, what: &str, err: &RigError) {
        tracing::warn!(error = %err, "{what} failed");
        self.refresh_status(state, format!("{what}: {err}"));
    }

    /// Start streaming, calibrate zoom, apply initial zoom/focus, IR on.
    ///
    /// The preview loop must be (re)spawned by the caller afterwards.
    pub fn start_preview(&self) -> Result<(), RigError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.preview_running {
            return Ok(());
        }
        if let Err(e) = state.camera.start() {
            let err = RigError::from(e);
            self.report(state, "camera start", &err);
            return Err(err);
        }
        state.preview_running = true;
        self.preview_epoch.fetch_add(1, Ordering::AcqRel);

        state.zoom.calibrate(state.camera.as_mut(), state.resolution);
        if state.focus.is_available() {
            if let Err(e) = state.focus.set_position(state.camera.as_mut(), INITIAL_FOCUS) {
                tracing::warn!(error = %e, "failed to apply initial focus");
            }
        }
        let zoom = state.zoom.set_factor(state.camera.as_mut(), INITIAL_ZOOM);
        if !zoom.applied {
            tracing::warn!(factor = zoom.factor, "initial zoom not applied");
        }

        if let Err(e) = state.illumination.apply(state.lights.as_mut(), Phase::Preview) {
            self.report(state, "IR illumination", &RigError::from(e));
        } else {
            self.refresh_status(state, "preview started");
        }
        self.publish(|s| s.effective_zoom = Some(zoom.effective));
        tracing::info!("preview started");
        Ok(())
    }

    /// Stop streaming and switch both lights off.
    pub fn stop_preview(&self) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.preview_running = false;
        if let Err(e) = state.camera.stop() {
            tracing::warn!(error = %e, "camera stop failed");
        }
        state.zoom.invalidate();
        if let Err(e) = state.illumination.apply(state.lights.as_mut(), Phase::Idle) {
            self.report(state, "lights off", &RigError::from(e));
        } else {
            self.refresh_status(state, "preview stopped");
        }
        self.publish(|s| s.effective_zoom = None);
        tracing::info!("preview stopped");
    }

    /// Zoom in (positive) or out (negative) by `delta`.
    pub fn zoom(&self, delta: f64) -> ZoomUpdate {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let update = state.zoom.set_zoom(state.camera.as_mut(), delta);
        let message = if update.applied || update.crop.is_none() {
            format!("zoom {}", state.zoom.readout())
        } else {
            format!("zoom {} (not applied)", state.zoom.readout())
        };
        self.refresh_status(state, message);
        if update.applied {
            self.publish(|s| s.effective_zoom = Some(update.effective));
        }
        update
    }

    /// Move focus nearer (positive) or farther (negative) by `delta`.
    pub fn focus(&self, delta: f64) -> Result<f64, RigError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        match state.focus.nudge(state.camera.as_mut(), delta) {
            Ok(position) => {
                self.refresh_status(state, format!("focus {position:.2}"));
                Ok(position)
            }
            Err(err) => {
                self.report(state, "focus", &err);
                Err(err)
            }
        }
    }

    /// Switch to continuous autofocus and sample the lens shortly after.
    pub fn enable_autofocus(self: &Arc<Self>) -> Result<(), RigError> {
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if let Err(err) = state.focus.enable_auto(state.camera.as_mut()) {
                self.report(state, "autofocus", &err);
                return Err(err);
            }
            self.refresh_status(state, "autofocus on");
        }

        let session = Arc::clone(self);
        std::thread::Builder::new()
            .name("fundus-af-sample".into())
            .spawn(move || {
                std::thread::sleep(AUTO_SAMPLE_DELAY);
                if session.capture_in_flight() {
                    tracing::debug!("skipping autofocus sample during capture");
                    return;
                }
                let mut guard = session.lock_state();
                let state = &mut *guard;
                if let Some(position) = state.focus.sample(state.camera.as_mut()) {
                    tracing::debug!(position, "autofocus settled sample");
                    let message = session.status().message;
                    session.refresh_status(state, message);
                }
            })
            .map_err(RigError::Spawn)?;
        Ok(())
    }

    /// Back to the initial zoom and manual focus.
    pub fn reset_to_defaults(&self) -> ZoomUpdate {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let zoom = state.zoom.set_factor(state.camera.as_mut(), INITIAL_ZOOM);
        let focus = if state.focus.is_available() {
            state
                .focus
                .set_position(state.camera.as_mut(), INITIAL_FOCUS)
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "focus reset failed");
                    "failed".to_string()
                })
        } else {
            state.focus.readout()
        };
        self.refresh_status(
            state,
            format!("reset: zoom {:.1}×, focus {focus}", zoom.factor),
        );
        if zoom.applied {
            self.publish(|s| s.effective_zoom = Some(zoom.effective));
        }
        zoom
    }
}

/// Held for the whole life of one capture. Dropping it frees the device.
pub struct CaptureGuard {
    session: Arc<CameraSession>,
}

impl CaptureGuard {
    pub fn session(&self) -> &Arc<CameraSession> {
        &self.session
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.session
            .capture_in_flight
            .store(false, Ordering::Release);
        self.session
            .status_tx
            .send_modify(|s| s.capture_in_flight = false);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fundus_hw::mock::{MockCamera, MockLights};
    use fundus_hw::Rect;

    pub(crate) fn mock_session(settings: RigSettings) -> (Arc<CameraSession>, MockCamera, MockLights) {
        let camera = MockCamera::new();
        let lights = MockLights::new();
        let session = CameraSession::new(
            Box::new(camera.clone()),
            Box::new(lights.clone()),
            settings,
        )
        .unwrap();
        (session, camera, lights)
    }

    #[test]
    fn test_new_session_is_dark() {
        let (session, _camera, lights) = mock_session(RigSettings::default());
        let lights = lights.state();
        assert!(!lights.infrared && !lights.visible);
        assert!(!session.is_preview_running());
        assert_eq!(session.status().message, "ready");
    }

    #[test]
    fn test_start_preview_calibrates_and_lights_ir() {
        let (session, camera, lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();

        assert!(session.is_preview_running());
        assert_eq!(camera.state().crop, Rect::new(480, 270, 320, 180));
        assert_eq!(camera.state().lens_position, INITIAL_FOCUS);
        assert!(lights.state().infrared);
        assert!(!lights.state().visible);

        let status = session.status();
        assert_eq!(status.zoom, "4.0x");
        assert_eq!(status.focus, "5.00");
        assert_eq!(status.effective_zoom, Some(4.0));
    }

    #[test]
    fn test_stop_preview_turns_everything_off() {
        let (session, camera, lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        session.stop_preview();
        assert!(!session.is_preview_running());
        assert!(!camera.state().streaming);
        let lights = lights.state();
        assert!(!lights.infrared && !lights.visible);
    }

    #[test]
    fn test_restart_recalibrates() {
        let (session, camera, _lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        session.zoom(-3.0);
        session.stop_preview();
        session.start_preview().unwrap();
        // The baseline is the full frame again, not the 1.0x crop of the last run.
        assert_eq!(camera.state().crop, Rect::new(480, 270, 320, 180));
    }

    #[test]
    fn test_zoom_failure_is_reported_not_fatal() {
        let (session, camera, _lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        camera.state().fail_controls = true;
        let update = session.zoom(-1.0);
        assert!(!update.applied);
        let status = session.status();
        assert_eq!(status.zoom, "3.0x");
        assert!(status.message.contains("not applied"), "{}", status.message);
    }

    #[test]
    fn test_reset_to_defaults() {
        let (session, camera, _lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        session.zoom(-2.0);
        session.enable_autofocus().unwrap();
        session.reset_to_defaults();
        assert_eq!(camera.state().crop, Rect::new(480, 270, 320, 180));
        assert_eq!(camera.state().lens_position, INITIAL_FOCUS);
        assert_eq!(session.status().message, "reset: zoom 4.0×, focus 5.00");
    }

    #[test]
    fn test_focus_unsupported_reports_status() {
        let camera = MockCamera::fixed_focus();
        let session = CameraSession::new(
            Box::new(camera),
            Box::new(MockLights::new()),
            RigSettings::default(),
        )
        .unwrap();
        assert!(matches!(
            session.focus(0.1),
            Err(RigError::CapabilityUnsupported(_))
        ));
        assert_eq!(session.status().focus, "unsupported");
    }

    #[test]
    fn test_autofocus_sample_populates_observation() {
        let (session, camera, _lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        camera.state().lens_position = 7.5;
        session.enable_autofocus().unwrap();
        std::thread::sleep(AUTO_SAMPLE_DELAY + Duration::from_millis(200));
        assert_eq!(
            session.lock_state().focus.last_observed_auto_position(),
            Some(7.5)
        );
    }
}
