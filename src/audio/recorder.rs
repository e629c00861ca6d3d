//! Audio capture engine
//!
//! The CaptureEngine owns one recording session at a time: the capture stream,
//! the container writer and the frame-delivery worker. Frames flow from the
//! device over an unbounded channel to a blocking worker that writes them to
//! the container and derives one amplitude sample per frame. Recording is
//! controlled via start() and stop().

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::amplitude::AmplitudeRingBuffer;
use super::device::{CaptureDevice, CaptureStream, FrameReceiver};
use super::paths::generate_clip_path;
use super::wav::{PcmContainerWriter, MAX_DATA_LEN};
use crate::clip::{Clock, Metadata, RecordedClip};
use crate::error::{AudioError, Result};
use crate::notify::{Notification, Notifier};

/// What the delivery worker hands back once the frame channel closes.
struct Delivery {
    writer: PcmContainerWriter,
    frames: u64,
    failure: Option<AudioError>,
}

/// State of the session in progress.
struct ActiveCapture {
    session_name: String,
    metadata: Metadata,
    path: PathBuf,
    started_at: DateTime<Utc>,
    stream: Box<dyn CaptureStream>,
    delivery: JoinHandle<Delivery>,
}

/// Capture engine: at most one active recording session.
pub struct CaptureEngine {
    device: Arc<dyn CaptureDevice>,
    recordings_dir: PathBuf,
    amplitude: Arc<AmplitudeRingBuffer>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    /// Held across start/stop so the two never interleave.
    active: Mutex<Option<ActiveCapture>>,
    recording: AtomicBool,
    max_clip_bytes: u32,
}

impl CaptureEngine {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        recordings_dir: impl Into<PathBuf>,
        amplitude: Arc<AmplitudeRingBuffer>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device,
            recordings_dir: recordings_dir.into(),
            amplitude,
            notifier,
            clock,
            active: Mutex::new(None),
            recording: AtomicBool::new(false),
            max_clip_bytes: MAX_DATA_LEN,
        }
    }

    /// Limit the PCM data of one clip. Frames past the limit fail the session.
    pub fn with_max_clip_bytes(mut self, bytes: u32) -> Self {
        self.max_clip_bytes = bytes.min(MAX_DATA_LEN);
        self
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn device_label(&self) -> String {
        self.device.label()
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Start a new recording session.
    ///
    /// Returns `Ok(false)` without touching anything if a session is already
    /// active. Device and file failures release whatever was acquired and are
    /// returned as errors.
    pub async fn start(&self, session_name: &str, metadata: Metadata) -> Result<bool> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            log::warn!("Capture already active, ignoring start for {:?}", session_name);
            return Ok(false);
        }

        let started_at = self.clock.now();
        let path = generate_clip_path(&self.recordings_dir, session_name, started_at)
            .map_err(|e| AudioError::io(&self.recordings_dir, e))?;
        let writer = PcmContainerWriter::create(&path, self.device.format())?
            .with_max_data_len(self.max_clip_bytes);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let device = Arc::clone(&self.device);
        let opened = tokio::task::spawn_blocking(move || device.open(frames_tx))
            .await
            .map_err(|e| AudioError::Internal(format!("Device open task failed: {}", e)))
            .and_then(|opened| opened);

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to open capture device: {}", e);
                discard(writer);
                return Err(e);
            }
        };

        let amplitude = Arc::clone(&self.amplitude);
        let notifier = self.notifier.clone();
        let delivery = tokio::task::spawn_blocking(move || {
            deliver_frames(frames_rx, writer, &amplitude, &notifier)
        });

        log::info!("Recording started: {:?}", path);

        *active = Some(ActiveCapture {
            session_name: session_name.to_string(),
            metadata,
            path,
            started_at,
            stream,
            delivery,
        });
        self.recording.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Stop the active session and return the finished clip.
    ///
    /// Returns `Ok(None)` when nothing is recording. Device teardown and
    /// writer finalize both run even if one of them fails; a device error is
    /// logged, a container error is returned after cleanup.
    pub async fn stop(&self) -> Result<Option<RecordedClip>> {
        let mut active = self.active.lock().await;
        let Some(capture) = active.take() else {
            log::debug!("Stop requested with no active capture");
            return Ok(None);
        };
        self.recording.store(false, Ordering::SeqCst);
        let stopped_at = self.clock.now();

        let ActiveCapture {
            session_name,
            metadata,
            path,
            started_at,
            stream,
            delivery,
        } = capture;

        // Frame channel closes once the stream has stopped and released its sender
        match tokio::task::spawn_blocking(move || stream.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Capture device stop failed: {}", e),
            Err(e) => log::error!("Capture device stop task failed: {}", e),
        }

        let Delivery {
            mut writer,
            frames,
            failure,
        } = delivery
            .await
            .map_err(|e| AudioError::Internal(format!("Frame delivery task failed: {}", e)))?;

        let finalized = writer.finalize();
        if let Some(e) = failure {
            log::error!("Recording {:?} lost frames: {}", path, e);
            return Err(e);
        }
        let data_len = finalized.inspect_err(|e| {
            log::error!("Failed to finalize {:?}: {}", path, e);
        })?;

        let duration_secs = (stopped_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        log::info!(
            "Recording stopped: {:?} ({} frames, {} bytes, {:.2}s)",
            path,
            frames,
            data_len,
            duration_secs
        );

        Ok(Some(RecordedClip {
            id: None,
            file_path: path,
            title: String::new(),
            notes: String::new(),
            keywords: Vec::new(),
            session_name,
            started_at,
            stopped_at,
            duration_secs,
            metadata,
            device: self.device.label(),
            user: None,
        }))
    }
}

/// Drain frames until every sender is gone. A write failure is kept and the
/// remaining frames are still drained so the device never blocks on us.
fn deliver_frames(
    mut frames: FrameReceiver,
    mut writer: PcmContainerWriter,
    amplitude: &AmplitudeRingBuffer,
    notifier: &Notifier,
) -> Delivery {
    let mut count = 0u64;
    let mut failure = None;

    while let Some(frame) = frames.blocking_recv() {
        if failure.is_none() {
            if let Err(e) = writer.write_chunk(&frame.to_le_bytes()) {
                log::error!("Failed to write frame: {}", e);
                failure = Some(e);
            }
        }

        let level = frame.level();
        amplitude.push(level);
        notifier.publish(Notification::AmplitudeUpdated(level));
        count += 1;
    }

    Delivery {
        writer,
        frames: count,
        failure,
    }
}

/// Close and remove a container that never received a session.
fn discard(mut writer: PcmContainerWriter) {
    let path = writer.path().to_path_buf();
    if let Err(e) = writer.finalize() {
        log::warn!("Failed to close discarded container {:?}: {}", path, e);
    }
    drop(writer);
    if let Err(e) = std::fs::remove_file(&path) {
        log::warn!("Failed to remove discarded container {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::FrameSender;
    use crate::audio::frame::{AudioFrame, PcmFormat};
    use crate::audio::wav::HEADER_LEN;
    use chrono::TimeZone;
    use parking_lot::Mutex as SyncMutex;

    struct FixedClock(SyncMutex<DateTime<Utc>>);

    impl FixedClock {
        fn new() -> Self {
            Self(SyncMutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()))
        }

        fn advance_ms(&self, ms: i64) {
            *self.0.lock() += chrono::Duration::milliseconds(ms);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    /// Device whose frames are pushed by the test.
    #[derive(Default)]
    struct FakeDevice {
        sender: Arc<SyncMutex<Option<FrameSender>>>,
        fail_open: bool,
    }

    struct FakeStream(Arc<SyncMutex<Option<FrameSender>>>);

    impl CaptureStream for FakeStream {
        fn stop(self: Box<Self>) -> Result<()> {
            self.0.lock().take();
            Ok(())
        }
    }

    impl CaptureDevice for FakeDevice {
        fn label(&self) -> String {
            "Fake Mic".to_string()
        }

        fn format(&self) -> PcmFormat {
            PcmFormat::voice()
        }

        fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>> {
            if self.fail_open {
                return Err(AudioError::device("unplugged"));
            }
            *self.sender.lock() = Some(frames);
            Ok(Box::new(FakeStream(Arc::clone(&self.sender))))
        }
    }

    impl FakeDevice {
        fn push(&self, frame: AudioFrame) {
            if let Some(tx) = self.sender.lock().as_ref() {
                tx.send(frame).unwrap();
            }
        }
    }

    fn engine(
        dir: &Path,
        device: Arc<FakeDevice>,
        clock: Arc<FixedClock>,
    ) -> (CaptureEngine, Arc<AmplitudeRingBuffer>) {
        let amplitude = Arc::new(AmplitudeRingBuffer::new(8));
        let engine = CaptureEngine::new(
            device,
            dir,
            Arc::clone(&amplitude),
            Notifier::default(),
            clock,
        );
        (engine, amplitude)
    }

    #[tokio::test]
    async fn test_double_start_and_idle_stop() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice::default());
        let (engine, _) = engine(dir.path(), device, Arc::new(FixedClock::new()));

        assert!(engine.stop().await.unwrap().is_none());
        assert!(engine.start("S", Metadata::new()).await.unwrap());
        assert!(engine.is_recording());
        assert!(!engine.start("S", Metadata::new()).await.unwrap());
        assert!(engine.stop().await.unwrap().is_some());
        assert!(!engine.is_recording());
        assert!(engine.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frames_reach_file_and_ring() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice::default());
        let clock = Arc::new(FixedClock::new());
        let (engine, amplitude) = engine(dir.path(), Arc::clone(&device), Arc::clone(&clock));

        let mut metadata = Metadata::new();
        metadata.insert("topic".to_string(), "standup".to_string());
        assert!(engine.start("Daily", metadata.clone()).await.unwrap());

        device.push(AudioFrame::new(vec![i16::MAX; 160]));
        device.push(AudioFrame::silence(160));
        clock.advance_ms(1500);

        let clip = engine.stop().await.unwrap().unwrap();
        assert_eq!(clip.session_name, "Daily");
        assert_eq!(clip.metadata, metadata);
        assert_eq!(clip.device, "Fake Mic");
        assert!((clip.duration_secs - 1.5).abs() < 1e-9);
        assert!(clip.is_valid());

        let len = std::fs::metadata(&clip.file_path).unwrap().len();
        assert_eq!(len, (HEADER_LEN + 2 * 160 * 2) as u64);

        let snapshot = amplitude.snapshot();
        assert_eq!(snapshot[6], 1.0);
        assert_eq!(snapshot[7], 0.0);
    }

    #[tokio::test]
    async fn test_write_failure_finalizes_then_reports() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice::default());
        let (engine, amplitude) =
            engine(dir.path(), Arc::clone(&device), Arc::new(FixedClock::new()));
        // Room for two 160-sample frames
        let engine = engine.with_max_clip_bytes(640);

        assert!(engine.start("Long", Metadata::new()).await.unwrap());
        for _ in 0..3 {
            device.push(AudioFrame::new(vec![i16::MAX; 160]));
        }

        let result = engine.stop().await;
        assert!(matches!(result, Err(AudioError::ContainerFull(_))));
        assert!(!engine.is_recording());

        // The frames that fit are kept in a finalized container
        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let bytes = std::fs::read(&file).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 640);
        assert_eq!(&bytes[40..44], &640u32.to_le_bytes());

        // Metering kept going past the failure
        assert_eq!(amplitude.snapshot()[5..], [1.0, 1.0, 1.0]);

        // The engine is usable again
        assert!(engine.start("Next", Metadata::new()).await.unwrap());
        assert!(engine.stop().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice {
            fail_open: true,
            ..Default::default()
        });
        let (engine, _) = engine(dir.path(), device, Arc::new(FixedClock::new()));

        let result = engine.start("S", Metadata::new()).await;
        assert!(matches!(result, Err(AudioError::Device(_))));
        assert!(!engine.is_recording());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
