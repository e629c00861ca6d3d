//! Recording library: the signed-in user plus a clip store
//!
//! Finished clips are archived here. Only well-formed clips are accepted, and
//! each is stamped with the current user before it reaches the store.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::clip::{ClipId, RecordedClip, User};
use crate::store::{ClipStore, StoreError, StoreResult};

pub struct RecordingLibrary<S: ClipStore> {
    store: S,
    user: RwLock<Option<User>>,
}

impl<S: ClipStore> RecordingLibrary<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            user: RwLock::new(None),
        }
    }

    pub fn set_user(&self, user: Option<User>) {
        *self.user.write() = user;
    }

    pub fn current_user(&self) -> Option<User> {
        self.user.read().clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Save a finished clip. Rejects clips with no duration or no file.
    pub fn archive(&self, mut clip: RecordedClip) -> StoreResult<ClipId> {
        if !clip.is_valid() {
            log::warn!(
                "Refusing to archive {:?} ({:.2}s)",
                clip.file_path,
                clip.duration_secs
            );
            return Err(StoreError::InvalidClip(format!(
                "{:?} is missing or empty",
                clip.file_path
            )));
        }
        if clip.user.is_none() {
            clip.user = self.current_user();
        }
        self.store.save(clip)
    }

    pub fn last_recording(&self) -> StoreResult<Option<RecordedClip>> {
        self.store.last_recording()
    }

    pub fn all_recordings(&self) -> StoreResult<Vec<RecordedClip>> {
        self.store.all_recordings()
    }

    pub fn recordings_for_session(&self, session_name: &str) -> StoreResult<Vec<RecordedClip>> {
        self.store.recordings_for_session(session_name)
    }

    pub fn recordings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RecordedClip>> {
        self.store.recordings_between(from, to)
    }

    pub fn get(&self, id: ClipId) -> StoreResult<Option<RecordedClip>> {
        self.store.get(id)
    }

    pub fn rename(&self, id: ClipId, title: &str) -> StoreResult<RecordedClip> {
        self.store.rename(id, title)
    }

    pub fn annotate(&self, id: ClipId, notes: &str, keywords: &[String]) -> StoreResult<RecordedClip> {
        self.store.annotate(id, notes, keywords)
    }

    /// Forget a clip, optionally removing its file too.
    pub fn delete(&self, id: ClipId, remove_file: bool) -> StoreResult<RecordedClip> {
        let clip = self.store.delete(id)?;
        if remove_file {
            match std::fs::remove_file(&clip.file_path) {
                Ok(()) => log::info!("Removed clip file {:?}", clip.file_path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::warn!("Clip file {:?} was already gone", clip.file_path)
                }
                Err(source) => {
                    return Err(StoreError::Io {
                        path: clip.file_path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(clip)
    }
}
