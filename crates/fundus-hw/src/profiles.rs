//! Rig profile database.
//!
//! Maps a board id to the GPIO lines that drive its LED channels. Profile
//! files are embedded at compile time from `contrib/rig/*.toml`.

use serde::Deserialize;
use std::sync::OnceLock;

const PROFILE_RPI_FUNDUS_V1: &str = include_str!("../../../contrib/rig/rpi-fundus-v1.toml");
const PROFILE_RPI5_FUNDUS_V1: &str = include_str!("../../../contrib/rig/rpi5-fundus-v1.toml");

static PROFILE_DB: OnceLock<Vec<RigProfile>> = OnceLock::new();

/// Top-level profile file structure (one per `contrib/rig/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct RigProfile {
    pub board: BoardInfo,
    pub lights: LightLines,
}

/// Board identification from the `[board]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardInfo {
    pub id: String,
    pub name: String,
}

/// GPIO wiring from the `[lights]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LightLines {
    /// GPIO character device, e.g. `/dev/gpiochip0`.
    pub chip: String,
    pub infrared_line: u32,
    pub visible_line: u32,
    /// False when the LED drivers switch on with a low level.
    #[serde(default = "default_active_high")]
    pub active_high: bool,
}

fn default_active_high() -> bool {
    true
}

fn profile_db() -> &'static Vec<RigProfile> {
    PROFILE_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [PROFILE_RPI_FUNDUS_V1, PROFILE_RPI5_FUNDUS_V1] {
            match toml::from_str::<RigProfile>(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::error!(error = %e, "bad rig profile TOML"),
            }
        }
        db
    })
}

/// Look up a profile by board id.
pub fn lookup_profile(id: &str) -> Option<&'static RigProfile> {
    profile_db().iter().find(|p| p.board.id == id)
}

/// List all known profiles.
pub fn list_profiles() -> &'static [RigProfile] {
    profile_db()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_profiles_parse() {
        assert_eq!(list_profiles().len(), 2, "every embedded profile should parse");
    }

    #[test]
    fn test_lookup_default_rig() {
        let profile = lookup_profile("rpi-fundus-v1").unwrap();
        assert_eq!(profile.lights.infrared_line, 17);
        assert_eq!(profile.lights.visible_line, 27);
        assert!(profile.lights.active_high);
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup_profile("no-such-board").is_none());
    }
}
