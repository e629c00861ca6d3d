use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::{amplitude, paths, VOICE_SAMPLE_RATE};
use crate::notify;

const APP_DIR_NAME: &str = "voice-ledger";
const SETTINGS_FILE_NAME: &str = "settings.json";
const LIBRARY_FILE_NAME: &str = "library.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Settings I/O failed on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Where clip files are written. Defaults to the XDG data dir.
    pub recordings_dir: Option<PathBuf>,

    /// Clip metadata store. Defaults to library.json next to the recordings.
    pub library_path: Option<PathBuf>,

    /// Capture device name; the host default when unset.
    pub input_device: Option<String>,

    /// Requested capture rate. The device default is used when unsupported.
    pub preferred_sample_rate: u32,

    /// Number of amplitude samples kept for waveform rendering.
    pub amplitude_capacity: usize,

    /// Lifecycle tick period while recording or playing.
    pub tick_interval_ms: u64,

    /// How often the playback device is polled for completion.
    pub playback_poll_ms: u64,

    /// Notifications buffered per subscriber before it starts skipping.
    pub notification_capacity: usize,

    /// Cap on the PCM bytes of one clip. Unset means the RIFF 4 GiB limit.
    pub max_clip_bytes: Option<u32>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            recordings_dir: None,
            library_path: None,
            input_device: None,
            preferred_sample_rate: VOICE_SAMPLE_RATE,
            amplitude_capacity: amplitude::DEFAULT_CAPACITY,
            tick_interval_ms: 100,
            playback_poll_ms: 100,
            notification_capacity: notify::DEFAULT_CAPACITY,
            max_clip_bytes: None,
        }
    }
}

impl AppSettings {
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(paths::default_recordings_dir)
    }

    pub fn library_path(&self) -> PathBuf {
        self.library_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
                .join(LIBRARY_FILE_NAME)
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn playback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.playback_poll_ms.max(1))
    }
}

/// ~/.config/voice-ledger/settings.json
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults on any problem.
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
    let contents = serde_json::to_string_pretty(settings)?;
    write_atomic(path, contents.as_bytes()).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a temp file in the same directory, then rename over `path`.
/// A crash mid-write never leaves a truncated file behind.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, contents)?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e);
            }
        }
    }

    std::fs::rename(&tmp_path, path)
}
