//! Device abstractions consumed by the capture and playback engines

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use super::frame::{AudioFrame, PcmFormat};
use crate::error::Result;

/// Channel a capture device pushes frames into. Unbounded so the device
/// callback never blocks; the capture worker drains it.
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<AudioFrame>;

/// A microphone-like source delivering frames on a push model.
pub trait CaptureDevice: Send + Sync {
    /// Human readable device name stored on clips.
    fn label(&self) -> String;

    /// Format of the frames this device delivers.
    fn format(&self) -> PcmFormat;

    /// Start delivering frames into `frames` until the returned stream is stopped.
    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>>;
}

/// A running capture stream.
pub trait CaptureStream: Send {
    /// Stop the device. Returns only once no further frame will be sent, and
    /// every `FrameSender` clone held by the device has been dropped.
    fn stop(self: Box<Self>) -> Result<()>;
}

/// An output device able to play a container file.
pub trait PlaybackDevice: Send + Sync {
    /// Open `path` and start playing from `start_at`.
    fn open(&self, path: &Path, start_at: Duration) -> Result<Box<dyn PlaybackSession>>;
}

/// One playing (or paused) clip.
pub trait PlaybackSession: Send {
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn is_paused(&self) -> bool;
    /// True once the device has played everything or was stopped.
    fn is_finished(&self) -> bool;
    fn position(&self) -> Duration;
    fn seek(&self, position: Duration) -> Result<()>;
}
