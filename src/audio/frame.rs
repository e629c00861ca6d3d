//! PCM format descriptor and captured audio frames

use std::time::Instant;

use super::amplitude::rms_level;

/// Sample rate used when the device does not dictate one.
pub const VOICE_SAMPLE_RATE: u32 = 16_000;

/// Describes the PCM layout written into a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// 16 kHz, mono, 16-bit.
    pub fn voice() -> Self {
        Self::new(VOICE_SAMPLE_RATE, 1, 16)
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_sample / 8
    }

    /// sampleRate × channels × bytesPerSample, saturating.
    pub fn byte_rate(&self) -> u32 {
        self.checked_byte_rate().unwrap_or(u32::MAX)
    }

    /// channels × bytesPerSample, saturating.
    pub fn block_align(&self) -> u16 {
        self.checked_block_align().unwrap_or(u16::MAX)
    }

    pub fn checked_byte_rate(&self) -> Option<u32> {
        self.sample_rate
            .checked_mul(u32::from(self.channels))?
            .checked_mul(u32::from(self.bytes_per_sample()))
    }

    pub fn checked_block_align(&self) -> Option<u16> {
        self.channels.checked_mul(self.bytes_per_sample())
    }

    /// True if a 44-byte PCM header can describe this layout.
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.channels > 0
            && self.bits_per_sample > 0
            && self.bits_per_sample % 8 == 0
            && self.checked_byte_rate().is_some()
            && self.checked_block_align().is_some()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::voice()
    }
}

/// A block of signed 16-bit samples delivered by a capture device.
///
/// Frames are consumed immediately by the container writer and the amplitude
/// deriver; they are never persisted on their own.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from a little-endian byte buffer. A trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples)
    }

    pub fn silence(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// RMS amplitude of this frame in [0.0, 1.0].
    pub fn level(&self) -> f32 {
        rms_level(&self.samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_format_rates() {
        let format = PcmFormat::voice();
        assert_eq!(format.byte_rate(), 32_000);
        assert_eq!(format.block_align(), 2);

        let stereo = PcmFormat::new(44_100, 2, 16);
        assert_eq!(stereo.byte_rate(), 176_400);
        assert_eq!(stereo.block_align(), 4);
    }

    #[test]
    fn oversized_formats_are_invalid() {
        assert!(PcmFormat::voice().is_valid());

        let huge = PcmFormat::new(3_000_000_000, 2, 16);
        assert_eq!(huge.checked_byte_rate(), None);
        assert_eq!(huge.byte_rate(), u32::MAX);
        assert!(!huge.is_valid());

        assert!(!PcmFormat::new(16_000, 0, 16).is_valid());
        assert!(!PcmFormat::new(16_000, 1, 12).is_valid());
        assert!(!PcmFormat::new(0, 1, 16).is_valid());
    }

    #[test]
    fn frame_bytes_are_little_endian() {
        let frame = AudioFrame::new(vec![1, -2, i16::MAX]);
        let bytes = frame.to_le_bytes();
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0xFF, 0x7F]);

        let parsed = AudioFrame::from_le_bytes(&bytes);
        assert_eq!(parsed.samples, frame.samples);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let frame = AudioFrame::from_le_bytes(&[0x10, 0x00, 0x7F]);
        assert_eq!(frame.samples, vec![16]);
    }
}
