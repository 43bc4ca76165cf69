//! Periodic live-view loop.

use crate::session::CameraSession;
use fundus_hw::frame::{self, ScalePolicy};
use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const PREVIEW_PERIOD_MIN: Duration = Duration::from_millis(50);
pub const PREVIEW_PERIOD_MAX: Duration = Duration::from_millis(100);

/// Smallest display box a frame is ever scaled into.
pub const MIN_DISPLAY_SIDE: u32 = 100;

/// Where preview frames go.
pub trait PreviewSink: Send {
    /// Current size of the display area in pixels.
    fn display_box(&self) -> (u32, u32);
    fn present(&mut self, image: RgbImage);
}

/// Sink that keeps the latest scaled frame for on-demand readers.
#[derive(Clone)]
pub struct SharedFrame {
    latest: Arc<Mutex<Option<RgbImage>>>,
    width: u32,
    height: u32,
}

impl SharedFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
            width,
            height,
        }
    }

    pub fn latest(&self) -> Option<RgbImage> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PreviewSink for SharedFrame {
    fn display_box(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn present(&mut self, image: RgbImage) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(image);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CaptureInFlight,
    DeviceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Preview is off (or restarted under a newer loop); the loop ends.
    Stopped,
    Skipped(SkipReason),
    Presented,
    Failed,
}

pub struct PreviewLoop<S> {
    session: Arc<CameraSession>,
    sink: S,
    policy: ScalePolicy,
    period: Duration,
    epoch: u64,
    consecutive_failures: u32,
}

impl<S: PreviewSink + 'static> PreviewLoop<S> {
    /// Bind a loop to the session's current preview run.
    pub fn new(
        session: Arc<CameraSession>,
        sink: S,
        policy: ScalePolicy,
        period: Duration,
    ) -> Self {
        let epoch = session.preview_epoch();
        Self {
            session,
            sink,
            policy,
            period: period.clamp(PREVIEW_PERIOD_MIN, PREVIEW_PERIOD_MAX),
            epoch,
            consecutive_failures: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One preview step. Never waits on the device.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.session.is_preview_running() || self.session.preview_epoch() != self.epoch {
            return TickOutcome::Stopped;
        }
        if self.session.capture_in_flight() {
            return TickOutcome::Skipped(SkipReason::CaptureInFlight);
        }
        let Some(mut guard) = self.session.try_lock_state() else {
            return TickOutcome::Skipped(SkipReason::DeviceBusy);
        };
        let state = &mut *guard;
        if !state.preview_running {
            return TickOutcome::Stopped;
        }

        let frame = match state.camera.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    tracing::warn!(error = %e, "preview frame failed");
                } else {
                    tracing::debug!(
                        error = %e,
                        failures = self.consecutive_failures,
                        "preview frame failed"
                    );
                }
                return TickOutcome::Failed;
            }
        };

        // Readouts: live AF position and the zoom the sensor actually applied.
        let (effective, focus) = match state.camera.read_metadata() {
            Ok(metadata) => {
                state.focus.observe(&metadata);
                (state.zoom.effective_from(&metadata), state.focus.readout())
            }
            Err(e) => {
                tracing::trace!(error = %e, "preview metadata unavailable");
                (None, state.focus.readout())
            }
        };
        drop(guard);

        if self.consecutive_failures > 0 {
            tracing::info!(failures = self.consecutive_failures, "preview recovered");
            self.consecutive_failures = 0;
        }
        self.session.publish(|s| {
            s.focus = focus;
            if effective.is_some() {
                s.effective_zoom = effective;
            }
        });

        let image = match frame.into_image() {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(error = %e, "bad preview frame");
                return TickOutcome::Failed;
            }
        };
        let (w, h) = self.sink.display_box();
        let scaled = frame::scale_into(
            &image,
            w.max(MIN_DISPLAY_SIDE),
            h.max(MIN_DISPLAY_SIDE),
            self.policy,
        );
        self.sink.present(scaled);
        TickOutcome::Presented
    }

    /// Run the loop on its own thread until preview stops.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("fundus-preview".into())
            .spawn(move || {
                tracing::debug!(period = ?self.period, epoch = self.epoch, "preview loop started");
                let mut deadline = Instant::now();
                loop {
                    if self.tick() == TickOutcome::Stopped {
                        break;
                    }
                    deadline += self.period;
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    } else {
                        // Fell behind; don't try to catch up with a burst.
                        deadline = now;
                    }
                }
                tracing::debug!(epoch = self.epoch, "preview loop exited");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureKind, CaptureSequencer};
    use crate::session::tests::mock_session;
    use crate::session::RigSettings;

    fn running() -> (
        Arc<CameraSession>,
        fundus_hw::mock::MockCamera,
        PreviewLoop<SharedFrame>,
        SharedFrame,
    ) {
        let (session, camera, _lights) = mock_session(RigSettings::default());
        session.start_preview().unwrap();
        let sink = SharedFrame::new(320, 240);
        let preview = PreviewLoop::new(
            Arc::clone(&session),
            sink.clone(),
            ScalePolicy::Cover,
            Duration::from_millis(50),
        );
        (session, camera, preview, sink)
    }

    #[test]
    fn test_tick_presents_scaled_frame() {
        let (_session, _camera, mut preview, sink) = running();
        assert_eq!(preview.tick(), TickOutcome::Presented);
        let image = sink.latest().unwrap();
        assert_eq!(image.dimensions(), (320, 240));
    }

    #[test]
    fn test_tiny_box_is_raised_to_minimum() {
        let (session, _camera, _preview, _sink) = running();
        let sink = SharedFrame::new(10, 0);
        let mut preview = PreviewLoop::new(
            session,
            sink.clone(),
            ScalePolicy::Contain,
            Duration::from_millis(50),
        );
        assert_eq!(preview.tick(), TickOutcome::Presented);
        assert_eq!(sink.latest().unwrap().dimensions(), (100, 100));
    }

    #[test]
    fn test_tick_stops_when_preview_stops() {
        let (session, _camera, mut preview, _sink) = running();
        session.stop_preview();
        assert_eq!(preview.tick(), TickOutcome::Stopped);
    }

    #[test]
    fn test_stale_loop_exits_after_restart() {
        let (session, _camera, mut preview, _sink) = running();
        session.stop_preview();
        session.start_preview().unwrap();
        assert_eq!(preview.tick(), TickOutcome::Stopped);
    }

    #[test]
    fn test_skips_while_capture_in_flight() {
        let (session, camera, mut preview, _sink) = running();
        let held = session.try_begin_capture().unwrap();
        let frames = camera.state().frames_captured;
        assert_eq!(
            preview.tick(),
            TickOutcome::Skipped(SkipReason::CaptureInFlight)
        );
        assert_eq!(camera.state().frames_captured, frames);
        drop(held);
        assert_eq!(preview.tick(), TickOutcome::Presented);
    }

    #[test]
    fn test_skips_when_device_locked() {
        let (session, _camera, mut preview, _sink) = running();
        let _state = session.lock_state();
        assert_eq!(preview.tick(), TickOutcome::Skipped(SkipReason::DeviceBusy));
    }

    #[test]
    fn test_failed_frame_is_not_fatal() {
        let (session, camera, mut preview, _sink) = running();
        camera.state().streaming = false;
        assert_eq!(preview.tick(), TickOutcome::Failed);
        assert_eq!(preview.tick(), TickOutcome::Failed);
        camera.state().streaming = true;
        assert_eq!(preview.tick(), TickOutcome::Presented);
        assert!(session.is_preview_running());
    }

    #[test]
    fn test_tick_refreshes_auto_focus_readout() {
        let (session, camera, mut preview, _sink) = running();
        session.enable_autofocus().unwrap();
        camera.state().lens_position = 2.5;
        preview.tick();
        assert_eq!(session.status().focus, "auto 2.50");
    }

    #[test]
    fn test_period_is_clamped() {
        let (session, _camera, _preview, sink) = running();
        let fast = PreviewLoop::new(
            Arc::clone(&session),
            sink.clone(),
            ScalePolicy::Cover,
            Duration::from_millis(5),
        );
        assert_eq!(fast.period(), PREVIEW_PERIOD_MIN);
        let slow = PreviewLoop::new(session, sink, ScalePolicy::Cover, Duration::from_secs(1));
        assert_eq!(slow.period(), PREVIEW_PERIOD_MAX);
    }

    #[test]
    fn test_spawned_loop_keeps_presenting_around_a_capture() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RigSettings {
            save_dir: dir.path().to_path_buf(),
            visible_window: Duration::from_millis(150),
            ..RigSettings::default()
        };
        let (session, camera, _lights) = mock_session(settings);
        session.start_preview().unwrap();
        let sink = SharedFrame::new(160, 120);
        let handle = PreviewLoop::new(
            Arc::clone(&session),
            sink.clone(),
            ScalePolicy::Cover,
            Duration::from_millis(50),
        )
        .spawn()
        .unwrap();

        let outcome = CaptureSequencer::new(Arc::clone(&session))
            .request(CaptureKind::Visible)
            .unwrap()
            .blocking_recv()
            .unwrap();
        assert!(outcome.result.is_ok());
        std::thread::sleep(Duration::from_millis(120));
        assert!(sink.latest().is_some());
        assert!(camera.state().frames_captured > 1);

        session.stop_preview();
        handle.join().unwrap();
    }
}
