//! Microphone capture using CPAL
//!
//! CPAL streams are not `Send`, so each opened stream lives on a dedicated
//! thread. The thread builds the stream, reports readiness, then parks until
//! it is told to stop; dropping the stream there halts the device callback
//! before the thread exits.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::device::{CaptureDevice, CaptureStream, FrameSender};
use super::frame::{AudioFrame, PcmFormat};
use crate::error::{AudioError, Result};

/// Input device information for device pickers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub default_sample_rate: u32,
    pub channels: u16,
}

/// Capture device backed by a CPAL input device.
///
/// Frames are always delivered as mono 16-bit PCM at the device's sample rate.
pub struct CpalInput {
    device_name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl CpalInput {
    /// Resolve the named input device (or the default one) and pick a stream
    /// config, preferring `preferred_sample_rate` when the device supports it.
    pub fn new(device_name: Option<&str>, preferred_sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = resolve_input_device(&host, device_name)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        log::info!("Using audio input device: {}", name);

        let supported = preferred_config(&device, preferred_sample_rate)
            .or_else(|| device.default_input_config().ok())
            .ok_or_else(|| AudioError::device(format!("{} has no usable input config", name)))?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        Ok(Self {
            device_name: name,
            sample_format: supported.sample_format(),
            config: supported.config(),
        })
    }

    /// List every input device of the default host.
    pub fn list_devices() -> Result<Vec<InputDeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::device(format!("Failed to enumerate devices: {}", e)))?;

        let mut out = Vec::new();
        for (index, device) in devices.enumerate() {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Microphone {}", index + 1));
            let (default_sample_rate, channels) = device
                .default_input_config()
                .map(|c| (c.sample_rate().0, c.channels()))
                .unwrap_or((0, 0));
            out.push(InputDeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                default_sample_rate,
                channels,
            });
        }
        Ok(out)
    }
}

impl CaptureDevice for CpalInput {
    fn label(&self) -> String {
        self.device_name.clone()
    }

    fn format(&self) -> PcmFormat {
        PcmFormat::new(self.config.sample_rate.0, 1, 16)
    }

    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(&device_name, &config, sample_format, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Park until stop() (or the handle is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture stream dropped");
            })
            .map_err(|e| AudioError::device(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCaptureStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::device("Capture thread exited before starting"))
            }
        }
    }
}

struct CpalCaptureStream {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCaptureStream {
    fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| AudioError::device("Capture thread panicked")),
            None => Ok(()),
        }
    }
}

impl CaptureStream for CpalCaptureStream {
    fn stop(mut self: Box<Self>) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Capture stream shutdown failed: {}", e);
        }
    }
}

/// Stand-in used when no input device could be opened at startup, so that
/// playback and library commands keep working. Recording reports the cause.
pub struct UnavailableInput {
    reason: String,
}

impl UnavailableInput {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CaptureDevice for UnavailableInput {
    fn label(&self) -> String {
        "Unavailable".to_string()
    }

    fn format(&self) -> PcmFormat {
        PcmFormat::voice()
    }

    fn open(&self, _frames: FrameSender) -> Result<Box<dyn CaptureStream>> {
        Err(AudioError::device(self.reason.clone()))
    }
}

fn resolve_input_device(host: &Host, device_name: Option<&str>) -> Result<Device> {
    match device_name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioError::device(format!("Failed to enumerate devices: {}", e)))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::device(format!("Input device '{}' not found", wanted))),
        None => host.default_input_device().ok_or(AudioError::NoInputDevice),
    }
}

fn preferred_config(device: &Device, sample_rate: u32) -> Option<cpal::SupportedStreamConfig> {
    let configs = device.supported_input_configs().ok()?;
    configs
        .filter(|range| {
            matches!(
                range.sample_format(),
                SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
            )
        })
        .find(|range| {
            range.min_sample_rate().0 <= sample_rate && sample_rate <= range.max_sample_rate().0
        })
        .map(|range| range.with_sample_rate(SampleRate(sample_rate)))
}

fn open_stream(
    device_name: &str,
    config: &StreamConfig,
    sample_format: SampleFormat,
    frames: FrameSender,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = resolve_input_device(&host, Some(device_name))?;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, config, frames),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, config, frames),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, config, frames),
        other => Err(AudioError::device(format!(
            "Unsupported input sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::device(format!("Failed to start stream: {}", e)))?;

    log::info!("Capture stream started on {}", device_name);
    Ok(stream)
}

fn build_stream_typed<T>(device: &Device, config: &StreamConfig, frames: FrameSender) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples = downmix_to_i16(data, channels);
                // Receiver gone means the session is shutting down
                let _ = frames.send(AudioFrame::new(samples));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::device(format!("Failed to create audio stream: {}", e)))
}

/// Average interleaved channels into mono 16-bit samples.
fn downmix_to_i16<T>(data: &[T], channels: usize) -> Vec<i16>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
            float_to_i16(sum / frame.len() as f32)
        })
        .collect()
}

/// Clamp and convert a float sample to i16.
fn float_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_i16() {
        assert_eq!(float_to_i16(0.0), 0);
        assert_eq!(float_to_i16(1.0), i16::MAX);
        assert_eq!(float_to_i16(-1.0), -i16::MAX);

        // Test clamping
        assert_eq!(float_to_i16(2.0), i16::MAX);
        assert_eq!(float_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_downmix_stereo_f32() {
        let data = [1.0f32, 0.0, 0.5, 0.5, -1.0, -1.0];
        let mono = downmix_to_i16(&data, 2);
        assert_eq!(mono.len(), 3);
        assert_eq!(mono[0], float_to_i16(0.5));
        assert_eq!(mono[1], float_to_i16(0.5));
        assert_eq!(mono[2], -i16::MAX);
    }

    #[test]
    fn test_downmix_mono_i16_passthrough() {
        let data = [0i16, 16_384, -16_384];
        let mono = downmix_to_i16(&data, 1);
        assert_eq!(mono[0], 0);
        assert!((mono[1] - 16_384).abs() <= 1);
        assert!((mono[2] + 16_384).abs() <= 1);
    }
}
