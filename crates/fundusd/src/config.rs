use fundus_core::RigSettings;
use fundus_hw::{Resolution, ScalePolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested sensor resolution.
    pub width: u32,
    pub height: u32,
    /// Base directory for photos (default: ~/Pictures).
    pub save_dir: PathBuf,
    /// Visible light window per photo.
    pub visible_window: Duration,
    /// Preview tick period, 50–100 ms.
    pub preview_period: Duration,
    /// Display box the preview is scaled into.
    pub preview_width: u32,
    pub preview_height: u32,
    pub scale_policy: ScalePolicy,
    /// Lock AE/AWB during the flash.
    pub freeze_exposure: bool,
    /// Rig profile id naming the GPIO chip and lines.
    pub rig_profile: String,
    /// Run against the in-memory camera and lights.
    pub mock: bool,
    pub autostart_preview: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `FUNDUS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let save_dir = var("FUNDUS_SAVE_DIR").map(PathBuf::from).unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join("Pictures")
        });

        let scale_policy = match var("FUNDUS_SCALE_POLICY").map(|v| v.parse::<ScalePolicy>()) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring FUNDUS_SCALE_POLICY");
                ScalePolicy::default()
            }
            None => ScalePolicy::default(),
        };

        let preview_ms = env_u64(&var, "FUNDUS_PREVIEW_PERIOD_MS", 50).clamp(50, 100);

        Self {
            camera_device: var("FUNDUS_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            width: env_u32(&var, "FUNDUS_WIDTH", 1280),
            height: env_u32(&var, "FUNDUS_HEIGHT", 720),
            save_dir,
            visible_window: Duration::from_millis(env_u64(&var, "FUNDUS_VISIBLE_WINDOW_MS", 1000)),
            preview_period: Duration::from_millis(preview_ms),
            preview_width: env_u32(&var, "FUNDUS_PREVIEW_WIDTH", 640),
            preview_height: env_u32(&var, "FUNDUS_PREVIEW_HEIGHT", 360),
            scale_policy,
            freeze_exposure: env_bool(&var, "FUNDUS_FREEZE_EXPOSURE", true),
            rig_profile: var("FUNDUS_RIG_PROFILE").unwrap_or_else(|| "rpi-fundus-v1".to_string()),
            mock: env_bool(&var, "FUNDUS_MOCK", false),
            autostart_preview: env_bool(&var, "FUNDUS_AUTOSTART_PREVIEW", true),
            system_bus: env_bool(&var, "FUNDUS_SYSTEM_BUS", false),
        }
    }

    pub fn rig_settings(&self) -> RigSettings {
        RigSettings {
            resolution: Resolution::new(self.width, self.height),
            save_dir: self.save_dir.clone(),
            visible_window: self.visible_window,
            freeze_exposure: self.freeze_exposure,
            ..RigSettings::default()
        }
    }
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(default)
}
