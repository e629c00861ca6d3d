pub mod audio;
pub mod clip;
pub mod effects;
pub mod error;
pub mod library;
pub mod lifecycle;
pub mod notify;
pub mod settings;
pub mod state_machine;
pub mod store;

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use audio::{
    AmplitudeRingBuffer, CaptureDevice, CaptureEngine, CpalInput, PlaybackDevice, PlaybackEngine,
    RodioOutput, UnavailableInput,
};
use clip::{Clock, RecordedClip, SystemClock};
use effects::AudioEffectRunner;
use library::RecordingLibrary;
use notify::Notifier;
use settings::AppSettings;
use store::{JsonClipStore, StoreError};

pub use error::{AudioError, Result};
pub use lifecycle::{LifecycleHandle, Outcome, StatusSnapshot};
pub use state_machine::{LifecycleState, SeekTarget};

/// Install the `log` backend. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Composition root: engines, coordinator and library wired from settings.
///
/// Must be built inside a Tokio runtime; the state loop is spawned on it.
pub struct App {
    pub settings: AppSettings,
    pub coordinator: LifecycleHandle,
    pub playback: Arc<PlaybackEngine>,
    pub library: RecordingLibrary<JsonClipStore>,
    state_loop: JoinHandle<()>,
}

impl App {
    /// Build with the configured CPAL input and rodio output.
    /// Returns Ok even if the input device isn't available - errors happen at record time.
    pub fn build(settings: AppSettings) -> std::result::Result<Self, AppError> {
        let input: Arc<dyn CaptureDevice> = match CpalInput::new(
            settings.input_device.as_deref(),
            settings.preferred_sample_rate,
        ) {
            Ok(input) => Arc::new(input),
            Err(e) => {
                log::warn!("Audio input init failed (recording disabled): {}", e);
                Arc::new(UnavailableInput::new(e.to_string()))
            }
        };
        Self::with_devices(
            settings,
            input,
            Arc::new(RodioOutput::new()),
            Arc::new(SystemClock),
        )
    }

    /// Build around the given devices and clock.
    pub fn with_devices(
        settings: AppSettings,
        input: Arc<dyn CaptureDevice>,
        output: Arc<dyn PlaybackDevice>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, AppError> {
        let library = RecordingLibrary::new(JsonClipStore::open(settings.library_path())?);
        let notifier = Notifier::new(settings.notification_capacity);
        let amplitude = Arc::new(AmplitudeRingBuffer::new(settings.amplitude_capacity));

        let mut capture = CaptureEngine::new(
            input,
            settings.recordings_dir(),
            Arc::clone(&amplitude),
            notifier.clone(),
            clock,
        );
        if let Some(limit) = settings.max_clip_bytes {
            capture = capture.with_max_clip_bytes(limit);
        }
        let capture = Arc::new(capture);
        let playback = Arc::new(PlaybackEngine::new(
            output,
            settings.playback_poll_interval(),
        ));

        let runner = AudioEffectRunner::new(
            capture,
            Arc::clone(&playback),
            notifier.clone(),
            Arc::clone(&amplitude),
            settings.tick_interval(),
        );
        let (coordinator, state_loop) = LifecycleHandle::spawn(runner, notifier, amplitude);

        log::info!(
            "voice-ledger ready: recordings in {:?}",
            settings.recordings_dir()
        );

        Ok(Self {
            settings,
            coordinator,
            playback,
            library,
            state_loop,
        })
    }

    /// Stop whatever is active and wait for the state loop to end.
    /// Returns the clip of a recording that was still running.
    pub async fn shutdown(self) -> Result<Option<RecordedClip>> {
        let clip = self.coordinator.shutdown().await?;
        if let Err(e) = self.state_loop.await {
            log::error!("State loop task failed: {}", e);
        }
        Ok(clip)
    }
}
