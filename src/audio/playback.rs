//! Audio playback engine
//!
//! Wraps a `PlaybackDevice` and enforces a single active stream: starting a
//! new clip supersedes the one playing. Completion is detected by polling
//! the device at a fixed interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::device::{PlaybackDevice, PlaybackSession};
use super::wav::wav_duration;
use crate::error::{AudioError, Result};

/// Default device poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a playback wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The device played everything.
    Finished,
    /// The caller's cancellation token fired; the stream was stopped.
    Cancelled,
    /// `stop()` was called on the engine.
    Stopped,
    /// Another clip took over the device.
    Superseded,
    /// The requested file does not exist.
    NotFound,
}

/// Identifies one started stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackTicket {
    generation: u64,
    path: PathBuf,
}

impl PlaybackTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct ActivePlayback {
    generation: u64,
    session: Box<dyn PlaybackSession>,
}

enum Poll {
    Playing,
    Finished,
    Gone,
}

pub struct PlaybackEngine {
    device: Arc<dyn PlaybackDevice>,
    poll_interval: Duration,
    active: Mutex<Option<ActivePlayback>>,
    generation: AtomicU64,
}

impl PlaybackEngine {
    pub fn new(device: Arc<dyn PlaybackDevice>, poll_interval: Duration) -> Self {
        Self {
            device,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Open `path` and start playing from `from`, superseding any active stream.
    pub async fn start(&self, path: &Path, from: Duration) -> Result<PlaybackTicket> {
        if !path.exists() {
            return Err(AudioError::NotFound(path.to_path_buf()));
        }

        // Release the device before opening it again
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            log::info!("Superseding playback #{}", previous.generation);
            previous.session.stop();
            drop(previous);
        }

        let device = Arc::clone(&self.device);
        let open_path = path.to_path_buf();
        let session = tokio::task::spawn_blocking(move || device.open(&open_path, from))
            .await
            .map_err(|e| AudioError::Internal(format!("Playback open task failed: {}", e)))??;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = self.active.lock().replace(ActivePlayback {
            generation,
            session,
        });
        if let Some(replaced) = replaced {
            // A concurrent start won the race for the device slot
            replaced.session.stop();
        }

        log::info!("Playback #{} started: {:?} from {:?}", generation, path, from);
        Ok(PlaybackTicket {
            generation,
            path: path.to_path_buf(),
        })
    }

    /// Wait until the ticket's stream ends or `cancel` fires.
    pub async fn wait(&self, ticket: &PlaybackTicket, cancel: &CancellationToken) -> PlaybackEnd {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_generation(ticket.generation);
                    log::debug!("Playback #{} cancelled", ticket.generation);
                    return PlaybackEnd::Cancelled;
                }
                _ = interval.tick() => {}
            }

            match self.poll(ticket.generation) {
                Poll::Playing => continue,
                Poll::Finished => {
                    log::info!("Playback #{} finished: {:?}", ticket.generation, ticket.path);
                    return PlaybackEnd::Finished;
                }
                Poll::Gone => {
                    return if self.generation.load(Ordering::SeqCst) == ticket.generation {
                        PlaybackEnd::Stopped
                    } else {
                        PlaybackEnd::Superseded
                    };
                }
            }
        }
    }

    /// Play a clip to completion or cancellation. A missing file is reported
    /// as `PlaybackEnd::NotFound`, not an error.
    pub async fn play(&self, path: &Path, cancel: &CancellationToken) -> Result<PlaybackEnd> {
        let ticket = match self.start(path, Duration::ZERO).await {
            Ok(ticket) => ticket,
            Err(AudioError::NotFound(missing)) => {
                log::warn!("Cannot play missing file {:?}", missing);
                return Ok(PlaybackEnd::NotFound);
            }
            Err(e) => return Err(e),
        };
        Ok(self.wait(&ticket, cancel).await)
    }

    /// Pause the active stream. False if nothing is playing.
    pub fn pause(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(active) if !active.session.is_paused() => {
                active.session.pause();
                true
            }
            _ => false,
        }
    }

    /// Resume a paused stream. False if nothing is paused.
    pub fn resume(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(active) if active.session.is_paused() => {
                active.session.resume();
                true
            }
            _ => false,
        }
    }

    /// Stop and release the active stream. False if there was none.
    pub fn stop(&self) -> bool {
        let active = self.active.lock().take();
        match active {
            Some(active) => {
                active.session.stop();
                log::info!("Playback #{} stopped", active.generation);
                true
            }
            None => false,
        }
    }

    /// Move the active stream to `position`. `Ok(false)` if nothing is playing.
    pub fn seek(&self, position: Duration) -> Result<bool> {
        match self.active.lock().as_ref() {
            Some(active) => {
                active.session.seek(position)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn position(&self) -> Option<Duration> {
        self.active.lock().as_ref().map(|a| a.session.position())
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Playable length of a clip in seconds; 0.0 (logged) if it cannot be read.
    /// Never touches the active stream.
    pub async fn duration(&self, path: &Path) -> f64 {
        probe_duration(path).await
    }

    fn poll(&self, generation: u64) -> Poll {
        let mut active = self.active.lock();
        let finished = match active.as_ref() {
            Some(a) if a.generation == generation => a.session.is_finished(),
            _ => return Poll::Gone,
        };
        if !finished {
            return Poll::Playing;
        }

        // Release the session outside the lock
        let done = active.take();
        drop(active);
        drop(done);
        Poll::Finished
    }

    fn stop_generation(&self, generation: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.generation) == Some(generation) {
            let cancelled = active.take();
            drop(active);
            if let Some(cancelled) = cancelled {
                cancelled.session.stop();
            }
        }
    }
}

/// Playable length of a clip in seconds, read off the blocking pool.
/// Missing or unreadable files report 0.0 and a log line.
pub async fn probe_duration(path: &Path) -> f64 {
    let probe = path.to_path_buf();
    match tokio::task::spawn_blocking(move || wav_duration(&probe)).await {
        Ok(Ok(duration)) => duration.as_secs_f64(),
        Ok(Err(AudioError::NotFound(missing))) => {
            log::warn!("Duration requested for missing file {:?}", missing);
            0.0
        }
        Ok(Err(e)) => {
            log::warn!("Could not read duration of {:?}: {}", path, e);
            0.0
        }
        Err(e) => {
            log::error!("Duration task failed: {}", e);
            0.0
        }
    }
}
