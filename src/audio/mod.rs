//! Audio module for voice-ledger
//!
//! This module handles microphone capture, WAV container writing, amplitude
//! derivation and clip playback. Uses CPAL for capture, rodio for playback
//! and hound for reading containers back.

pub mod amplitude;
pub mod device;
pub mod frame;
pub mod input;
pub mod output;
pub mod paths;
pub mod playback;
pub mod recorder;
pub mod wav;

pub use amplitude::{rms_level, AmplitudeRingBuffer};
pub use device::{
    CaptureDevice, CaptureStream, FrameReceiver, FrameSender, PlaybackDevice, PlaybackSession,
};
pub use frame::{AudioFrame, PcmFormat, VOICE_SAMPLE_RATE};
pub use input::{CpalInput, InputDeviceInfo, UnavailableInput};
pub use output::RodioOutput;
pub use paths::{default_recordings_dir, generate_clip_path};
pub use playback::{probe_duration, PlaybackEnd, PlaybackEngine, PlaybackTicket};
pub use recorder::CaptureEngine;
pub use wav::{convert_raw_pcm, encode_header, wav_duration, PcmContainerWriter};
