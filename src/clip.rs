//! Recorded clip model, user identity and wall clock

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the clip store.
pub type ClipId = u64;

/// Free-form key/value tags attached to a clip.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key that overrides the device label.
pub const DEVICE_TAG: &str = "Device";

/// Opaque identity passed through to clip metadata. Never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

/// The durable unit of output: one finished recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedClip {
    /// Assigned when the clip is saved to a store.
    #[serde(default)]
    pub id: Option<ClipId>,
    pub file_path: PathBuf,
    /// Display title. Title, notes and keywords may change after archiving.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub notes: String,
    /// Tagged keywords, trimmed and free of duplicates.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub session_name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub user: Option<User>,
}

impl RecordedClip {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Metadata "Device" tag wins over the capture device label.
    pub fn device_used(&self) -> &str {
        if let Some(device) = self.metadata.get(DEVICE_TAG).filter(|d| !d.trim().is_empty()) {
            return device;
        }
        if self.device.trim().is_empty() {
            "Unknown"
        } else {
            &self.device
        }
    }

    /// Title if set, otherwise the file name.
    pub fn display_title(&self) -> String {
        if self.title.trim().is_empty() {
            self.file_name()
        } else {
            self.title.clone()
        }
    }

    /// Well-formed: positive duration and the container exists on disk.
    pub fn is_valid(&self) -> bool {
        self.duration_secs > 0.0 && is_existing_file(&self.file_path)
    }
}

fn is_existing_file(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.is_file()
}

/// Source of wall-clock timestamps for clips.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
