use crate::config::Config;
use fundus_core::{
    CameraSession, CaptureKind, CaptureOutcome, CaptureSequencer, PreviewLoop, RigError,
    RigStatus, SharedFrame, ZoomUpdate,
};
use fundus_hw::mock::{MockCamera, MockLights};
use fundus_hw::profiles::lookup_profile;
use fundus_hw::{CameraDevice, GpioLights, LightDriver, ScalePolicy, V4l2Camera};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Rig(#[from] RigError),
    #[error("camera error: {0}")]
    Camera(#[from] fundus_hw::CameraError),
    #[error("light error: {0}")]
    Light(#[from] fundus_hw::LightError),
    #[error("unknown rig profile: {0}")]
    UnknownProfile(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartPreview {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StopPreview {
        reply: oneshot::Sender<()>,
    },
    Capture {
        kind: CaptureKind,
        reply: oneshot::Sender<Result<oneshot::Receiver<CaptureOutcome>, EngineError>>,
    },
    Zoom {
        delta: f64,
        reply: oneshot::Sender<ZoomUpdate>,
    },
    Focus {
        delta: f64,
        reply: oneshot::Sender<Result<f64, EngineError>>,
    },
    EnableAutofocus {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<ZoomUpdate>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Commands go through the engine; status and the latest preview frame are
/// read directly without a round trip.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    session: Arc<CameraSession>,
    frames: SharedFrame,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn start_preview(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::StartPreview { reply }).await?
    }

    pub async fn stop_preview(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::StopPreview { reply }).await
    }

    /// Take a photo and wait for the sequence to finish.
    pub async fn capture(&self, kind: CaptureKind) -> Result<PathBuf, EngineError> {
        let outcome = self
            .call(|reply| EngineRequest::Capture { kind, reply })
            .await??;
        let outcome = outcome.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(outcome.result?)
    }

    pub async fn zoom(&self, delta: f64) -> Result<ZoomUpdate, EngineError> {
        self.call(|reply| EngineRequest::Zoom { delta, reply }).await
    }

    pub async fn focus(&self, delta: f64) -> Result<f64, EngineError> {
        self.call(|reply| EngineRequest::Focus { delta, reply }).await?
    }

    pub async fn enable_autofocus(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::EnableAutofocus { reply })
            .await?
    }

    pub async fn reset(&self) -> Result<ZoomUpdate, EngineError> {
        self.call(|reply| EngineRequest::Reset { reply }).await
    }

    pub fn status(&self) -> RigStatus {
        self.session.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<RigStatus> {
        self.session.subscribe()
    }

    /// Latest scaled preview frame, if preview has produced one.
    pub fn latest_frame(&self) -> Option<image::RgbImage> {
        self.frames.latest()
    }
}

/// Open the hardware named by `config`, or the mocks when `FUNDUS_MOCK=1`.
fn open_hardware(
    config: &Config,
) -> Result<(Box<dyn CameraDevice>, Box<dyn LightDriver>), EngineError> {
    if config.mock {
        tracing::warn!("FUNDUS_MOCK=1: using in-memory camera and lights");
        return Ok((Box::new(MockCamera::new()), Box::new(MockLights::new())));
    }

    let camera = V4l2Camera::open(&config.camera_device)?;
    tracing::info!(device = %config.camera_device, "camera opened");

    let profile = lookup_profile(&config.rig_profile)
        .ok_or_else(|| EngineError::UnknownProfile(config.rig_profile.clone()))?;
    let lights = GpioLights::open(&profile.lights)?;
    tracing::info!(
        profile = %profile.board.id,
        chip = %lights.chip_path(),
        infrared = profile.lights.infrared_line,
        visible = profile.lights.visible_line,
        "illumination lines requested"
    );
    Ok((Box::new(camera), Box::new(lights)))
}

struct PreviewConfig {
    policy: ScalePolicy,
    period: Duration,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Acquires the camera and light lines synchronously (fail-fast), then
/// serves requests until every handle is dropped.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let (camera, lights) = open_hardware(config)?;
    let session = CameraSession::new(camera, lights, config.rig_settings())?;
    let frames = SharedFrame::new(config.preview_width, config.preview_height);
    let preview = PreviewConfig {
        policy: config.scale_policy,
        period: config.preview_period,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    let engine_session = Arc::clone(&session);
    let engine_frames = frames.clone();
    std::thread::Builder::new()
        .name("fundus-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let sequencer = CaptureSequencer::new(Arc::clone(&engine_session));
            while let Some(req) = rx.blocking_recv() {
                handle(&engine_session, &sequencer, &engine_frames, &preview, req);
            }
            engine_session.stop_preview();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        session,
        frames,
    })
}

fn handle(
    session: &Arc<CameraSession>,
    sequencer: &CaptureSequencer,
    frames: &SharedFrame,
    preview: &PreviewConfig,
    req: EngineRequest,
) {
    match req {
        EngineRequest::StartPreview { reply } => {
            let _ = reply.send(start_preview(session, frames, preview));
        }
        EngineRequest::StopPreview { reply } => {
            session.stop_preview();
            let _ = reply.send(());
        }
        EngineRequest::Capture { kind, reply } => {
            let result = sequencer.request(kind).map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Zoom { delta, reply } => {
            let _ = reply.send(session.zoom(delta));
        }
        EngineRequest::Focus { delta, reply } => {
            let _ = reply.send(session.focus(delta).map_err(EngineError::from));
        }
        EngineRequest::EnableAutofocus { reply } => {
            let _ = reply.send(session.enable_autofocus().map_err(EngineError::from));
        }
        EngineRequest::Reset { reply } => {
            let _ = reply.send(session.reset_to_defaults());
        }
    }
}

fn start_preview(
    session: &Arc<CameraSession>,
    frames: &SharedFrame,
    preview: &PreviewConfig,
) -> Result<(), EngineError> {
    if session.is_preview_running() {
        return Ok(());
    }
    session.start_preview()?;
    PreviewLoop::new(
        Arc::clone(session),
        frames.clone(),
        preview.policy,
        preview.period,
    )
    .spawn()
    .map_err(RigError::Spawn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundus_core::FocusMode;

    fn mock_config(dir: &std::path::Path) -> Config {
        let mut config = Config::from_lookup(|_| None);
        config.mock = true;
        config.save_dir = dir.to_path_buf();
        config.visible_window = Duration::from_millis(100);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_round_trip_on_mock_rig() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&mock_config(dir.path())).unwrap();

        engine.start_preview().await.unwrap();
        assert!(engine.status().preview_running);

        let update = engine.zoom(-1.0).await.unwrap();
        assert_eq!(update.factor, 3.0);
        assert!(update.applied);

        let position = engine.focus(0.5).await.unwrap();
        assert!((position - 5.5).abs() < 1e-9);

        engine.enable_autofocus().await.unwrap();
        assert_eq!(engine.status().focus_mode, Some(FocusMode::ContinuousAuto));

        let path = engine.capture(CaptureKind::Visible).await.unwrap();
        assert!(path.exists());

        engine.reset().await.unwrap();
        assert_eq!(engine.status().message, "reset: zoom 4.0×, focus 5.00");

        engine.stop_preview().await.unwrap();
        assert!(!engine.status().preview_running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_profile_fails_fast() {
        let mut config = Config::from_lookup(|_| None);
        config.mock = false;
        config.camera_device = "/dev/fundus-does-not-exist".into();
        config.rig_profile = "no-such-rig".into();
        assert!(spawn_engine(&config).is_err());
    }
}
