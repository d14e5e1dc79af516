use crate::escape::EscapeKeys;
use crate::event::KeyChord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Position enforcer tick in milliseconds (1–50). Default: 4.
    pub enforcer_interval_ms: u64,
    /// Accessibility trust poll in milliseconds (250–60000). Default: 2000.
    pub permission_poll_ms: u64,
    /// Keycode that unlocks a pointer lock. Default: 53 (Escape).
    pub cancel_keycode: u16,
    /// Second unlock keycode. Default: 36 (Return).
    pub confirm_keycode: u16,
    /// Distance in points the pointer may drift before it is warped back.
    pub warp_tolerance: f64,
    /// Append escape-triggered unlocks to the unlock log.
    pub record_escape_unlocks: bool,
    /// Chord that always passes a keyboard lock. Default: Cmd+Option+Escape.
    pub force_quit: KeyChord,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enforcer_interval_ms: 4,
            permission_poll_ms: 2000,
            cancel_keycode: KeyChord::ESCAPE,
            confirm_keycode: KeyChord::RETURN,
            warp_tolerance: 0.5,
            record_escape_unlocks: true,
            force_quit: KeyChord::FORCE_QUIT,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("inputlock");
        path.push("config.toml");
        path
    }

    /// Loads the user config, writing defaults on first run.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(contents) = fs::read_to_string(path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => return config.validated(),
                Err(e) => log::warn!("Ignoring malformed {}: {e}", path.display()),
            }
        }
        let default_config = Self::default();
        // Save defaults on first run
        if let Err(e) = default_config.save_to(path) {
            log::debug!("Could not write default config: {e}");
        }
        default_config
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, contents).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Clamp values to valid ranges.
    pub fn validated(mut self) -> Self {
        self.enforcer_interval_ms = self.enforcer_interval_ms.clamp(1, 50);
        self.permission_poll_ms = self.permission_poll_ms.clamp(250, 60_000);
        if !self.warp_tolerance.is_finite() || self.warp_tolerance < 0.0 {
            self.warp_tolerance = 0.5;
        }
        self
    }

    pub fn enforcer_interval(&self) -> Duration {
        Duration::from_millis(self.enforcer_interval_ms)
    }

    pub fn permission_poll(&self) -> Duration {
        Duration::from_millis(self.permission_poll_ms)
    }

    pub fn escape_keys(&self) -> EscapeKeys {
        EscapeKeys {
            cancel: self.cancel_keycode,
            confirm: self.confirm_keycode,
        }
    }
}
