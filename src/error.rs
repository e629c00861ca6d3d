//! Error types for the audio core

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

/// Errors raised by capture, container writing and playback.
///
/// "Already active" and "no active session" are not errors: start operations
/// report them as `Ok(false)` and stop operations as `Ok(None)`.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Audio device failure: {0}")]
    Device(String),

    #[error("Container I/O failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container {0:?} reached its size limit")]
    ContainerFull(PathBuf),

    #[error("Unsupported PCM format: {0}")]
    UnsupportedFormat(String),

    #[error("Container writer for {0:?} was already finalized")]
    AlreadyFinalized(PathBuf),

    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Invalid audio file {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },

    #[error("{0} is not implemented by this playback device")]
    NotImplemented(&'static str),

    #[error("Lifecycle coordinator is not running")]
    CoordinatorClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AudioError {
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures the UI should surface as "could not save the recording".
    pub fn is_io_failure(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::ContainerFull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let err = AudioError::io("/tmp/x.wav", std::io::Error::other("disk full"));
        assert!(err.is_io_failure());
        assert!(err.to_string().contains("disk full"));
        assert!(!AudioError::NoInputDevice.is_io_failure());
    }
}
