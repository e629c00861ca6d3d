//! Durable clip metadata store
//!
//! The capture core hands finished clips to a `ClipStore` and queries them by
//! recency or session name. `JsonClipStore` keeps every clip in one JSON file
//! that is rewritten atomically after each mutation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::clip::{ClipId, RecordedClip};
use crate::settings::write_atomic;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O failed on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store data is invalid: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No clip with id {0}")]
    NotFound(ClipId),

    #[error("Clip is not finalized: {0}")]
    InvalidClip(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Save/query interface over finished clips. Recency is `started_at`, newest first.
pub trait ClipStore: Send + Sync {
    /// Store a new clip and return its id.
    fn save(&self, clip: RecordedClip) -> StoreResult<ClipId>;
    fn last_recording(&self) -> StoreResult<Option<RecordedClip>>;
    fn all_recordings(&self) -> StoreResult<Vec<RecordedClip>>;
    fn recordings_for_session(&self, session_name: &str) -> StoreResult<Vec<RecordedClip>>;
    /// Clips whose `started_at` lies in `from..=to`.
    fn recordings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RecordedClip>>;
    fn get(&self, id: ClipId) -> StoreResult<Option<RecordedClip>>;
    /// Replace a stored clip. Only title, notes and keywords are expected to change.
    fn update(&self, clip: &RecordedClip) -> StoreResult<()>;
    /// Remove a clip and return what was stored.
    fn delete(&self, id: ClipId) -> StoreResult<RecordedClip>;

    fn rename(&self, id: ClipId, title: &str) -> StoreResult<RecordedClip> {
        let mut clip = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        clip.title = title.trim().to_string();
        self.update(&clip)?;
        Ok(clip)
    }

    /// Replace notes and keywords. Blank and repeated keywords are dropped.
    fn annotate(&self, id: ClipId, notes: &str, keywords: &[String]) -> StoreResult<RecordedClip> {
        let mut clip = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        clip.notes = notes.trim().to_string();
        clip.keywords.clear();
        for keyword in keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            if !clip.keywords.iter().any(|k| k.eq_ignore_ascii_case(keyword)) {
                clip.keywords.push(keyword.to_string());
            }
        }
        self.update(&clip)?;
        Ok(clip)
    }
}

/// Clip store backed by a single JSON file.
pub struct JsonClipStore {
    path: PathBuf,
    clips: Mutex<Vec<RecordedClip>>,
}

impl JsonClipStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let clips = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        log::info!("Clip store opened: {:?} ({} clips)", path, clips.len());
        Ok(Self {
            path,
            clips: Mutex::new(clips),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, clips: &[RecordedClip]) -> StoreResult<()> {
        let contents = serde_json::to_vec_pretty(clips)?;
        write_atomic(&self.path, &contents).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn newest_first(mut clips: Vec<RecordedClip>) -> Vec<RecordedClip> {
        clips.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        clips
    }
}

impl ClipStore for JsonClipStore {
    fn save(&self, mut clip: RecordedClip) -> StoreResult<ClipId> {
        let mut clips = self.clips.lock();
        let id = clips.iter().filter_map(|c| c.id).max().unwrap_or(0) + 1;
        clip.id = Some(id);

        let mut next = clips.clone();
        next.push(clip);
        self.persist(&next)?;
        *clips = next;

        log::info!("Clip {} saved", id);
        Ok(id)
    }

    fn last_recording(&self) -> StoreResult<Option<RecordedClip>> {
        Ok(self.all_recordings()?.into_iter().next())
    }

    fn all_recordings(&self) -> StoreResult<Vec<RecordedClip>> {
        Ok(Self::newest_first(self.clips.lock().clone()))
    }

    fn recordings_for_session(&self, session_name: &str) -> StoreResult<Vec<RecordedClip>> {
        let matching = self
            .clips
            .lock()
            .iter()
            .filter(|c| c.session_name == session_name)
            .cloned()
            .collect();
        Ok(Self::newest_first(matching))
    }

    fn recordings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RecordedClip>> {
        let matching = self
            .clips
            .lock()
            .iter()
            .filter(|c| c.started_at >= from && c.started_at <= to)
            .cloned()
            .collect();
        Ok(Self::newest_first(matching))
    }

    fn get(&self, id: ClipId) -> StoreResult<Option<RecordedClip>> {
        Ok(self.clips.lock().iter().find(|c| c.id == Some(id)).cloned())
    }

    fn update(&self, clip: &RecordedClip) -> StoreResult<()> {
        let id = clip
            .id
            .ok_or_else(|| StoreError::InvalidClip("clip has no id".to_string()))?;
        let mut clips = self.clips.lock();
        let index = clips
            .iter()
            .position(|c| c.id == Some(id))
            .ok_or(StoreError::NotFound(id))?;

        let mut next = clips.clone();
        next[index] = clip.clone();
        self.persist(&next)?;
        *clips = next;
        Ok(())
    }

    fn delete(&self, id: ClipId) -> StoreResult<RecordedClip> {
        let mut clips = self.clips.lock();
        let index = clips
            .iter()
            .position(|c| c.id == Some(id))
            .ok_or(StoreError::NotFound(id))?;

        let mut next = clips.clone();
        let removed = next.remove(index);
        self.persist(&next)?;
        *clips = next;

        log::info!("Clip {} deleted", id);
        Ok(removed)
    }
}
