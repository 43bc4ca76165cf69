use fundus_hw::{CameraError, LightError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by rig operations.
///
/// Everything except startup acquisition is recovered locally: callers log
/// it, keep their in-memory state and report it as status.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("{0} is not supported by this sensor")]
    CapabilityUnsupported(&'static str),
    #[error("device control failed: {0}")]
    DeviceControlFailure(#[from] CameraError),
    #[error("illumination failed: {0}")]
    IlluminationFailure(#[from] LightError),
    #[error("cannot write {}: {source}", path.display())]
    FilesystemFailure {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a capture is already in progress")]
    ConcurrentCaptureRejected,
    #[error("failed to start worker thread: {0}")]
    Spawn(std::io::Error),
}
