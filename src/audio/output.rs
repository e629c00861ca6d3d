//! Clip playback through rodio
//!
//! The rodio `OutputStream` is not `Send`, so each session keeps it alive on
//! its own thread and shares the `Sink` with the caller. The sink always holds
//! the whole clip, so positions and seeks are measured from its start.

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::source::SeekError;
use rodio::{OutputStream, Sink};

use super::device::{PlaybackDevice, PlaybackSession};
use crate::error::{AudioError, Result};

/// Plays 16-bit PCM containers on the default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioOutput;

impl RodioOutput {
    pub fn new() -> Self {
        Self
    }
}

/// Decoded clip ready to hand to a sink.
struct LoadedClip {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl LoadedClip {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AudioError::NotFound(path.to_path_buf()));
        }
        let reader = hound::WavReader::open(path).map_err(|e| AudioError::InvalidFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::InvalidFile {
                path: path.to_path_buf(),
                reason: "expected 16-bit integer PCM".to_string(),
            });
        }
        let mut samples = Vec::with_capacity(reader.len() as usize);
        for sample in reader.into_samples::<i16>() {
            match sample {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    log::warn!(
                        "Decoding {:?} stopped after {} samples: {}",
                        path,
                        samples.len(),
                        e
                    );
                    break;
                }
            }
        }
        // A truncated tail must not shift the channel order
        let channels = usize::from(spec.channels.max(1));
        samples.truncate(samples.len() - samples.len() % channels);

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    fn into_source(self) -> SamplesBuffer<i16> {
        SamplesBuffer::new(self.channels, self.sample_rate, self.samples)
    }
}

impl PlaybackDevice for RodioOutput {
    fn open(&self, path: &Path, start_at: Duration) -> Result<Box<dyn PlaybackSession>> {
        let clip = LoadedClip::load(path)?;
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Arc<Sink>>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread_path: PathBuf = path.to_path_buf();

        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::device(format!(
                            "Failed to open output stream: {}",
                            e
                        ))));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::device(format!(
                            "Failed to create sink: {}",
                            e
                        ))));
                        return;
                    }
                };

                // Seek before anything is heard
                sink.pause();
                sink.append(clip.into_source());
                if !start_at.is_zero() {
                    if let Err(e) = sink.try_seek(start_at) {
                        let _ = ready_tx.send(Err(AudioError::device(format!(
                            "Failed to start at {:?}: {}",
                            start_at, e
                        ))));
                        return;
                    }
                }
                sink.play();
                log::info!("Playback started: {:?} at {:?}", thread_path, start_at);
                let _ = ready_tx.send(Ok(Arc::clone(&sink)));

                let _ = stop_rx.recv();
                sink.stop();
                log::debug!("Playback stream released: {:?}", thread_path);
            })
            .map_err(|e| AudioError::device(format!("Failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(sink)) => Ok(Box::new(RodioSession {
                sink,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::device("Playback thread exited before starting"))
            }
        }
    }
}

struct RodioSession {
    sink: Arc<Sink>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackSession for RodioSession {
    fn pause(&self) {
        self.sink.pause();
    }

    fn resume(&self) {
        self.sink.play();
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_paused(&self) -> bool {
        self.sink.is_paused()
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn position(&self) -> Duration {
        self.sink.get_pos()
    }

    fn seek(&self, position: Duration) -> Result<()> {
        self.sink.try_seek(position).map_err(|e| match e {
            SeekError::NotSupported { .. } => AudioError::NotImplemented("seek"),
            other => AudioError::device(format!("Seek failed: {}", other)),
        })
    }
}

impl Drop for RodioSession {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::PcmFormat;
    use crate::audio::wav::PcmContainerWriter;

    fn write_clip(path: &Path, samples: &[i16]) {
        let mut writer = PcmContainerWriter::create(path, PcmFormat::voice()).unwrap();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        writer.write_chunk(&bytes).unwrap();
        writer.finalize().unwrap();
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let result = LoadedClip::load(Path::new("/nonexistent/clip.wav"));
        assert!(matches!(result, Err(AudioError::NotFound(_))));
    }

    #[test]
    fn load_rejects_garbage() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not a wav file").unwrap();
        let result = LoadedClip::load(file.path());
        assert!(matches!(result, Err(AudioError::InvalidFile { .. })));
    }

    #[test]
    fn source_seeks_anywhere_in_the_clip() {
        use rodio::Source;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_clip(&path, &vec![7i16; 16_000]);

        let clip = LoadedClip::load(&path).unwrap();
        assert_eq!(clip.samples.len(), 16_000);
        assert_eq!(clip.sample_rate, 16_000);
        assert_eq!(clip.channels, 1);

        // Opening at 0.8s then seeking back to 0.2s lands at 0.2s
        let mut source = clip.into_source();
        source.try_seek(Duration::from_millis(800)).unwrap();
        source.try_seek(Duration::from_millis(200)).unwrap();
        assert_eq!(source.count(), 12_800);
    }

    #[test]
    fn truncated_tail_keeps_decoded_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.wav");
        write_clip(&path, &[1, 2, 3, 4]);

        // Chop the last byte so the final sample cannot be decoded
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let clip = LoadedClip::load(&path).unwrap();
        assert_eq!(clip.samples, vec![1, 2, 3]);
    }
}
