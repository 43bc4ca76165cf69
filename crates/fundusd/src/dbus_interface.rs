use crate::engine::{EngineError, EngineHandle};
use fundus_core::{CaptureKind, RigError};
use zbus::interface;

pub const BUS_NAME: &str = "org.fundus.Rig1";
pub const OBJECT_PATH: &str = "/org/fundus/Rig1";

/// D-Bus interface for the fundus rig daemon.
///
/// Bus name: org.fundus.Rig1
/// Object path: /org/fundus/Rig1
pub struct FundusService {
    engine: EngineHandle,
}

impl FundusService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Rig(RigError::CapabilityUnsupported(what)) => {
            zbus::fdo::Error::NotSupported(format!("{what} is not supported by this sensor"))
        }
        EngineError::Rig(RigError::ConcurrentCaptureRejected) => {
            zbus::fdo::Error::LimitsExceeded("a capture is already in progress".into())
        }
        EngineError::Rig(e @ RigError::FilesystemFailure { .. }) => {
            zbus::fdo::Error::IOError(e.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn finite(delta: f64) -> zbus::fdo::Result<f64> {
    if delta.is_finite() {
        Ok(delta)
    } else {
        Err(zbus::fdo::Error::InvalidArgs(format!("delta must be finite, got {delta}")))
    }
}

#[interface(name = "org.fundus.Rig1")]
impl FundusService {
    /// Take a visible-light photo. Returns the saved path.
    async fn capture_visible(&self) -> zbus::fdo::Result<String> {
        tracing::info!("visible capture requested");
        let path = self
            .engine
            .capture(CaptureKind::Visible)
            .await
            .map_err(to_fdo)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Take an infrared photo. Returns the saved path.
    async fn capture_infrared(&self) -> zbus::fdo::Result<String> {
        tracing::info!("infrared capture requested");
        let path = self
            .engine
            .capture(CaptureKind::Infrared)
            .await
            .map_err(to_fdo)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Change zoom by `delta`. Returns the new zoom factor.
    async fn zoom(&self, delta: f64) -> zbus::fdo::Result<f64> {
        let update = self.engine.zoom(finite(delta)?).await.map_err(to_fdo)?;
        Ok(update.factor)
    }

    /// Move focus by `delta` (positive is nearer). Returns the lens position.
    async fn focus(&self, delta: f64) -> zbus::fdo::Result<f64> {
        self.engine.focus(finite(delta)?).await.map_err(to_fdo)
    }

    async fn enable_autofocus(&self) -> zbus::fdo::Result<()> {
        tracing::info!("autofocus requested");
        self.engine.enable_autofocus().await.map_err(to_fdo)
    }

    /// Return zoom and focus to their initial values.
    async fn reset(&self) -> zbus::fdo::Result<String> {
        self.engine.reset().await.map_err(to_fdo)?;
        Ok(self.engine.status().message)
    }

    async fn start_preview(&self) -> zbus::fdo::Result<()> {
        self.engine.start_preview().await.map_err(to_fdo)
    }

    async fn stop_preview(&self) -> zbus::fdo::Result<()> {
        self.engine.stop_preview().await.map_err(to_fdo)
    }

    /// Return rig status as a JSON document.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "rig": self.engine.status(),
        })
        .to_string())
    }

    /// Latest scaled preview frame as JPEG bytes.
    async fn preview_frame(&self) -> zbus::fdo::Result<Vec<u8>> {
        let image = self
            .engine
            .latest_frame()
            .ok_or_else(|| zbus::fdo::Error::Failed("no preview frame yet".into()))?;
        fundus_hw::frame::encode_jpeg(&image)
            .map_err(|e| zbus::fdo::Error::Failed(format!("failed to encode preview frame: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(EngineError::Rig(RigError::ConcurrentCaptureRejected)),
            zbus::fdo::Error::LimitsExceeded(_)
        ));
        assert!(matches!(
            to_fdo(EngineError::Rig(RigError::CapabilityUnsupported("manual focus"))),
            zbus::fdo::Error::NotSupported(_)
        ));
        assert!(matches!(
            to_fdo(EngineError::Rig(RigError::FilesystemFailure {
                path: PathBuf::from("/ro"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })),
            zbus::fdo::Error::IOError(_)
        ));
        assert!(matches!(
            to_fdo(EngineError::ChannelClosed),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_non_finite_delta_rejected() {
        assert!(finite(0.5).is_ok());
        assert!(matches!(
            finite(f64::NAN),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }
}
