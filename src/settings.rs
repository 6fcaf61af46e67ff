use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SettingsError;
use crate::remote::RemoteConfig;
use crate::state_machine::{MachineConfig, Variant};
use crate::synthesis::VoicePreferences;

const SETTINGS_DIR_NAME: &str = "jarvis";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Offline responder or remote conversational session.
    pub variant: Variant,

    /// Phrase that moves the assistant from passive listening to a command.
    pub wake_word: String,

    /// Debounce between a recognizer ending and the next one starting.
    pub restart_delay_ms: u64,

    /// Recognition language tag (BCP 47).
    pub language: String,

    /// Preferred local voice name; `None` picks the backend default.
    pub voice: Option<String>,
    pub speech_rate: f32,
    pub speech_pitch: f32,

    pub remote_model: String,
    pub remote_voice: String,
    pub instructions: String,

    /// Fixed seed for the fallback reply choice (reproducible runs).
    pub fallback_seed: Option<u64>,

    /// Capture frame length in ms.
    pub capture_frame_ms: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        let remote = RemoteConfig::default();
        let voice = VoicePreferences::default();
        Self {
            variant: Variant::Offline,
            wake_word: "jarvis".to_string(),
            restart_delay_ms: 100,
            language: "en-US".to_string(),
            voice: voice.voice,
            speech_rate: voice.rate,
            speech_pitch: voice.pitch,
            remote_model: remote.model,
            remote_voice: remote.voice,
            instructions: remote.instructions,
            fallback_seed: None,
            capture_frame_ms: 100,
        }
    }
}

impl AppSettings {
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig::new(
            self.variant,
            &self.wake_word,
            Duration::from_millis(self.restart_delay_ms),
        )
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            model: self.remote_model.clone(),
            voice: self.remote_voice.clone(),
            instructions: self.instructions.clone(),
        }
    }

    pub fn voice_preferences(&self) -> VoicePreferences {
        VoicePreferences {
            voice: self.voice.clone(),
            rate: self.speech_rate,
            pitch: self.speech_pitch,
        }
    }
}

/// `<config dir>/jarvis/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults on any problem
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Settings saved to {:?}", path);
    Ok(())
}
