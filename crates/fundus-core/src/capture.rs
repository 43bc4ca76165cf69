//! Single-flight photo capture.
//!
//! A visible capture freezes exposure and focus, switches from IR to the
//! visible light, reads the sensor at the middle of the light window, and
//! hands everything back exactly as it was. The whole sequence runs on a
//! detached worker thread while holding the session lock, so preview ticks
//! and control commands cannot touch the device mid-pulse.

use crate::error::RigError;
use crate::focus::{FocusMode, FocusSnapshot};
use crate::illumination::Phase;
use crate::session::{CameraSession, CaptureGuard, RigState};
use chrono::{Local, NaiveDateTime};
use fundus_hw::{CameraError, ControlKey, ControlValue, Controls};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const ROOT_DIR: &str = "Fundus";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Visible,
    Infrared,
}

impl CaptureKind {
    /// Sub-directory under `<base>/Fundus`.
    pub fn dir_name(self) -> &'static str {
        match self {
            CaptureKind::Visible => "Видимый",
            CaptureKind::Infrared => "ИК",
        }
    }
}

/// What a finished capture reports back.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub kind: CaptureKind,
    pub result: Result<PathBuf, RigError>,
    /// How long the visible light was on. `None` for infrared captures.
    pub pulse: Option<Duration>,
}

/// Device state recorded before a visible capture.
struct Snapshot {
    ae_enabled: Option<bool>,
    awb_enabled: Option<bool>,
    /// AE/AWB were switched off for this capture and must be switched back.
    exposure_frozen: bool,
    focus: FocusSnapshot,
}

impl Snapshot {
    /// Controls that were running before the capture and get frozen for it.
    fn running_auto_controls(&self) -> impl Iterator<Item = ControlKey> {
        [
            (ControlKey::AeEnable, self.ae_enabled),
            (ControlKey::AwbEnable, self.awb_enabled),
        ]
        .into_iter()
        .filter_map(|(key, was)| (was == Some(true)).then_some(key))
    }
}

pub struct CaptureSequencer {
    session: Arc<CameraSession>,
}

impl CaptureSequencer {
    pub fn new(session: Arc<CameraSession>) -> Self {
        Self { session }
    }

    /// Start a capture on a worker thread.
    ///
    /// Fails immediately with `ConcurrentCaptureRejected`, touching nothing,
    /// if another capture is still running.
    pub fn request(
        &self,
        kind: CaptureKind,
    ) -> Result<oneshot::Receiver<CaptureOutcome>, RigError> {
        let Some(guard) = self.session.try_begin_capture() else {
            tracing::info!(?kind, "capture rejected: another capture in progress");
            return Err(RigError::ConcurrentCaptureRejected);
        };
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("fundus-capture".into())
            .spawn(move || {
                let outcome = run(guard, kind);
                if tx.send(outcome).is_err() {
                    tracing::debug!("capture requester went away before the outcome");
                }
            })
            .map_err(RigError::Spawn)?;
        Ok(rx)
    }
}

fn run(guard: CaptureGuard, kind: CaptureKind) -> CaptureOutcome {
    let session = Arc::clone(guard.session());
    let mut state = session.lock_state();

    let (result, pulse) = match kind {
        CaptureKind::Visible => visible(&session, &mut state),
        CaptureKind::Infrared => (infrared(&session, &mut state), None),
    };

    let message = match &result {
        Ok(path) => {
            tracing::info!(?kind, path = %path.display(), ?pulse, "photo saved");
            format!("saved {}", path.display())
        }
        Err(e) => {
            tracing::warn!(?kind, error = %e, "capture failed");
            format!("capture failed: {e}")
        }
    };
    session.refresh_status(&state, message);
    drop(state);
    drop(guard);

    if let Ok(path) = &result {
        let path = path.clone();
        session.publish(|s| s.last_capture = Some(path));
    }
    CaptureOutcome {
        kind,
        result,
        pulse,
    }
}

fn visible(
    session: &CameraSession,
    state: &mut RigState,
) -> (Result<PathBuf, RigError>, Option<Duration>) {
    let settings = session.settings();
    let window = settings.visible_window;

    // 1. snapshot
    let snapshot = take_snapshot(state, settings.freeze_exposure);

    // 2-3. freeze
    if snapshot.exposure_frozen {
        freeze_exposure(state, &snapshot);
    }
    if let Err(e) = state.focus.pin_for_capture(state.camera.as_mut()) {
        tracing::warn!(error = %e, "failed to pin focus for capture");
    }

    // 4-8. pulse and capture
    let pulsed = state
        .illumination
        .apply(state.lights.as_mut(), Phase::CapturePulse)
        .map(|_| {
            let started = Instant::now();
            std::thread::sleep(window / 2);
            let result = save_photo(
                state,
                &settings.save_dir,
                CaptureKind::Visible,
                &settings.visible_prefix,
            );
            std::thread::sleep(window.saturating_sub(started.elapsed()));
            (result, started)
        });

    // 9. restore, whatever happened above
    let preview_running = state.preview_running;
    let restore_lights = state
        .illumination
        .apply(state.lights.as_mut(), Phase::PostPulse { preview_running });
    let pulse = pulsed.as_ref().ok().map(|(_, started)| started.elapsed());
    if let Err(e) = restore_lights {
        tracing::warn!(error = %e, "failed to restore illumination after capture");
    }
    restore(state, &snapshot);

    match pulsed {
        Ok((result, _)) => (result, pulse),
        Err(e) => {
            tracing::warn!(error = %e, "visible light did not switch on; capture skipped");
            (Err(e.into()), None)
        }
    }
}

fn infrared(session: &CameraSession, state: &mut RigState) -> Result<PathBuf, RigError> {
    let settings = session.settings();
    let preview_running = state.preview_running;
    state
        .illumination
        .apply(state.lights.as_mut(), Phase::InfraredCapture { preview_running })?;
    save_photo(
        state,
        &settings.save_dir,
        CaptureKind::Infrared,
        &settings.infrared_prefix,
    )
}

fn take_snapshot(state: &mut RigState, freeze_exposure: bool) -> Snapshot {
    let supported = state.camera.supported_controls();
    let metadata = state.camera.read_metadata().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "metadata unavailable for capture snapshot");
        Controls::new()
    });
    // Supported but unreported means the sensor is running its default: on.
    let flag = |key: ControlKey| {
        supported.contains(&key).then(|| {
            metadata
                .get(&key)
                .and_then(ControlValue::as_bool)
                .unwrap_or(true)
        })
    };
    let snapshot = Snapshot {
        ae_enabled: flag(ControlKey::AeEnable),
        awb_enabled: flag(ControlKey::AwbEnable),
        exposure_frozen: freeze_exposure,
        focus: state.focus.snapshot(),
    };
    tracing::debug!(
        ae = ?snapshot.ae_enabled,
        awb = ?snapshot.awb_enabled,
        focus = ?snapshot.focus,
        "capture snapshot"
    );
    snapshot
}

fn freeze_exposure(state: &mut RigState, snapshot: &Snapshot) {
    for key in snapshot.running_auto_controls() {
        if let Err(e) = state
            .camera
            .set_controls(&Controls::from([(key, ControlValue::Bool(false))]))
        {
            tracing::warn!(?key, error = %e, "failed to freeze control for capture");
        }
    }
}

fn restore(state: &mut RigState, snapshot: &Snapshot) {
    let frozen = snapshot
        .running_auto_controls()
        .filter(|_| snapshot.exposure_frozen);
    for key in frozen {
        if let Err(e) = state
            .camera
            .set_controls(&Controls::from([(key, ControlValue::Bool(true))]))
        {
            tracing::warn!(?key, error = %e, "failed to re-enable control after capture");
        }
    }
    if snapshot.focus.mode != FocusMode::Unavailable {
        if let Err(e) = state.focus.restore(state.camera.as_mut(), snapshot.focus) {
            tracing::warn!(error = %e, "failed to restore focus after capture");
        }
    }
}

fn save_photo(
    state: &mut RigState,
    base_dir: &Path,
    kind: CaptureKind,
    prefix: &str,
) -> Result<PathBuf, RigError> {
    let path = photo_path(base_dir, kind, prefix, Local::now().naive_local());
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| RigError::FilesystemFailure {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let path = unique_path(path);
    match state.camera.capture_to_file(&path) {
        Ok(()) => Ok(path),
        Err(CameraError::Io(source)) => Err(RigError::FilesystemFailure { path, source }),
        Err(e) => Err(e.into()),
    }
}

/// `<base>/Fundus/<kind dir>/<prefix>_<YYYYMMDD_HHMMSS>.jpg`
pub fn photo_path(
    base_dir: &Path,
    kind: CaptureKind,
    prefix: &str,
    at: NaiveDateTime,
) -> PathBuf {
    base_dir
        .join(ROOT_DIR)
        .join(kind.dir_name())
        .join(format!("{prefix}_{}.jpg", at.format("%Y%m%d_%H%M%S")))
}

/// Append `_1`, `_2`, ... before the extension until the name is free.
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{stem}_{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::mock_session;
    use crate::session::RigSettings;
    use fundus_hw::mock::{MockCamera, MockLights};
    use fundus_hw::AfMode;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_millis(200);

    fn rig() -> (TempDir, Arc<CameraSession>, MockCamera, MockLights) {
        rig_with(|_| {})
    }

    fn rig_with(
        adjust: impl FnOnce(&mut RigSettings),
    ) -> (TempDir, Arc<CameraSession>, MockCamera, MockLights) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = RigSettings {
            save_dir: dir.path().to_path_buf(),
            visible_window: WINDOW,
            ..RigSettings::default()
        };
        adjust(&mut settings);
        let (session, camera, lights) = mock_session(settings);
        session.start_preview().unwrap();
        (dir, session, camera, lights)
    }

    fn capture(session: &Arc<CameraSession>, kind: CaptureKind) -> CaptureOutcome {
        CaptureSequencer::new(Arc::clone(session))
            .request(kind)
            .unwrap()
            .blocking_recv()
            .unwrap()
    }

    #[test]
    fn test_visible_capture_saves_and_restores() {
        let (dir, session, camera, lights) = rig();
        let outcome = capture(&session, CaptureKind::Visible);

        let path = outcome.result.unwrap();
        assert!(path.starts_with(dir.path().join("Fundus").join("Видимый")));
        assert!(path.exists(), "{} missing", path.display());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("fundus_") && name.ends_with(".jpg"), "{name}");

        let cam = camera.state();
        assert!(cam.ae_enabled && cam.awb_enabled, "AE/AWB not restored");
        let lights = lights.state();
        assert!(lights.infrared && !lights.visible);
        assert!(!lights.overlap_seen());

        let status = session.status();
        assert!(!status.capture_in_flight);
        assert_eq!(status.last_capture, Some(path));
    }

    #[test]
    fn test_pulse_lasts_at_least_the_window() {
        let (_dir, session, camera, _lights) = rig();
        // Capture slower than half the window must not shorten the pulse.
        camera.state().capture_latency = Duration::from_millis(150);
        let outcome = capture(&session, CaptureKind::Visible);
        assert!(outcome.result.is_ok());
        let pulse = outcome.pulse.unwrap();
        assert!(pulse >= WINDOW, "pulse {pulse:?} shorter than {WINDOW:?}");
    }

    #[test]
    fn test_exposure_frozen_during_capture() {
        let (_dir, session, camera, _lights) = rig();
        capture(&session, CaptureKind::Visible);
        let log = &camera.state().control_log;
        let frozen = |key: ControlKey| {
            log.iter()
                .any(|c| c.get(&key) == Some(&ControlValue::Bool(false)))
        };
        assert!(frozen(ControlKey::AeEnable) && frozen(ControlKey::AwbEnable));
    }

    #[test]
    fn test_failed_capture_still_restores() {
        let (_dir, session, camera, lights) = rig();
        session.enable_autofocus().unwrap();
        camera.state().fail_capture = true;

        let outcome = capture(&session, CaptureKind::Visible);
        assert!(matches!(
            outcome.result,
            Err(RigError::DeviceControlFailure(_))
        ));

        let cam = camera.state();
        assert!(cam.ae_enabled && cam.awb_enabled);
        assert_eq!(cam.af_mode, AfMode::Continuous);
        let lights = lights.state();
        assert!(lights.infrared && !lights.visible);
        assert!(session.status().message.starts_with("capture failed"));
        assert!(!session.capture_in_flight());
    }

    #[test]
    fn test_unwritable_save_dir_still_restores() {
        let (_dir, session, camera, lights) = rig_with(|settings| {
            let blocker = settings.save_dir.join("not-a-dir");
            std::fs::write(&blocker, b"x").unwrap();
            settings.save_dir = blocker;
        });
        session.enable_autofocus().unwrap();

        let outcome = capture(&session, CaptureKind::Visible);
        match &outcome.result {
            Err(RigError::FilesystemFailure { path, .. }) => {
                assert!(path.starts_with(&session.settings().save_dir), "{}", path.display());
            }
            other => panic!("expected FilesystemFailure, got {other:?}"),
        }
        // The light window still runs its full length.
        assert!(outcome.pulse.unwrap() >= WINDOW);

        let cam = camera.state();
        assert!(cam.ae_enabled && cam.awb_enabled);
        assert_eq!(cam.af_mode, AfMode::Continuous);
        assert!(cam.files.is_empty());
        let lights = lights.state();
        assert!(lights.infrared && !lights.visible);
        assert!(session.status().message.starts_with("capture failed"));
        assert!(!session.capture_in_flight());
    }

    #[test]
    fn test_auto_exposure_off_before_capture_stays_off() {
        let (_dir, session, camera, _lights) = rig();
        camera.state().ae_enabled = false;
        let before = camera.state().control_log.len();

        assert!(capture(&session, CaptureKind::Visible).result.is_ok());

        let cam = camera.state();
        assert!(!cam.ae_enabled, "AE switched on by the capture");
        assert!(cam.awb_enabled);
        assert!(cam.control_log[before..]
            .iter()
            .all(|c| !c.contains_key(&ControlKey::AeEnable)));
    }

    #[test]
    fn test_freeze_disabled_leaves_auto_controls_alone() {
        let (_dir, session, camera, _lights) = rig_with(|settings| {
            settings.freeze_exposure = false;
        });
        let before = camera.state().control_log.len();

        assert!(capture(&session, CaptureKind::Visible).result.is_ok());

        let cam = camera.state();
        assert!(cam.control_log[before..].iter().all(|c| {
            !c.contains_key(&ControlKey::AeEnable) && !c.contains_key(&ControlKey::AwbEnable)
        }));
        assert!(cam.ae_enabled && cam.awb_enabled);
    }

    #[test]
    fn test_autofocus_pinned_then_resumed() {
        let (_dir, session, camera, _lights) = rig();
        session.enable_autofocus().unwrap();
        camera.state().lens_position = 6.1;
        capture(&session, CaptureKind::Visible);

        let cam = camera.state();
        let pinned = cam.control_log.iter().any(|c| {
            c.get(&ControlKey::AfMode) == Some(&ControlValue::AfMode(AfMode::Manual))
                && c.get(&ControlKey::LensPosition) == Some(&ControlValue::Float(6.1))
        });
        assert!(pinned, "lens was not pinned at the live position");
        assert_eq!(cam.af_mode, AfMode::Continuous);
    }

    #[test]
    fn test_rejected_while_in_flight_without_side_effects() {
        let (_dir, session, camera, lights) = rig();
        let held = session.try_begin_capture().unwrap();
        let controls_before = camera.state().control_log.len();
        let lights_before = lights.state().history.len();

        let err = CaptureSequencer::new(Arc::clone(&session))
            .request(CaptureKind::Visible)
            .unwrap_err();
        assert!(matches!(err, RigError::ConcurrentCaptureRejected));
        assert_eq!(camera.state().control_log.len(), controls_before);
        assert_eq!(lights.state().history.len(), lights_before);
        assert!(camera.state().files.is_empty());

        drop(held);
        assert!(!session.capture_in_flight());
    }

    #[test]
    fn test_two_rapid_requests_one_file() {
        let (_dir, session, camera, _lights) = rig();
        let sequencer = CaptureSequencer::new(Arc::clone(&session));
        let first = sequencer.request(CaptureKind::Visible).unwrap();
        let second = sequencer.request(CaptureKind::Visible);
        assert!(matches!(second, Err(RigError::ConcurrentCaptureRejected)));
        assert!(first.blocking_recv().unwrap().result.is_ok());
        assert_eq!(camera.state().files.len(), 1);
    }

    #[test]
    fn test_infrared_capture_never_lights_visible() {
        let (dir, session, camera, lights) = rig();
        let outcome = capture(&session, CaptureKind::Infrared);
        let path = outcome.result.unwrap();
        assert!(path.starts_with(dir.path().join("Fundus").join("ИК")));
        assert!(outcome.pulse.is_none());
        assert!(!lights.state().visible_ever_on());
        assert!(lights.state().infrared);
        // No freeze for infrared.
        assert!(camera
            .state()
            .control_log
            .iter()
            .all(|c| !c.contains_key(&ControlKey::AeEnable)));
    }

    #[test]
    fn test_light_failure_skips_capture() {
        let (_dir, session, camera, lights) = rig();
        lights.state().fail = true;
        let outcome = capture(&session, CaptureKind::Visible);
        assert!(matches!(
            outcome.result,
            Err(RigError::IlluminationFailure(_))
        ));
        assert!(camera.state().files.is_empty());
        assert!(camera.state().ae_enabled);
    }

    #[test]
    fn test_photo_path_format() {
        let at = NaiveDateTime::parse_from_str("2024-03-05 14:07:09", "%Y-%m-%d %H:%M:%S").unwrap();
        let path = photo_path(Path::new("/data"), CaptureKind::Infrared, "fundusIR", at);
        assert_eq!(
            path,
            PathBuf::from("/data/Fundus/ИК/fundusIR_20240305_140709.jpg")
        );
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fundus_20240305_140709.jpg");
        assert_eq!(unique_path(path.clone()), path);
        std::fs::write(&path, b"x").unwrap();
        let second = unique_path(path.clone());
        assert_eq!(second, dir.path().join("fundus_20240305_140709_1.jpg"));
        std::fs::write(&second, b"x").unwrap();
        assert_eq!(
            unique_path(path),
            dir.path().join("fundus_20240305_140709_2.jpg")
        );
    }
}
