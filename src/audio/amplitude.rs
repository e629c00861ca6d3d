//! Amplitude derivation and the shared amplitude ring buffer
//!
//! Every captured frame is reduced to one RMS level in [0.0, 1.0]. Levels are
//! kept in a fixed-capacity ring buffer that the capture worker writes and the
//! visualization side reads as chronological snapshots.

use parking_lot::Mutex;

/// Default number of amplitude samples kept for visualization.
pub const DEFAULT_CAPACITY: usize = 64;

/// Root-mean-square of samples normalized by `i16::MAX`, clamped to [0.0, 1.0].
/// An empty frame is silent.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let rms = (sum_squares / samples.len() as f64).sqrt();
    (rms as f32).clamp(0.0, 1.0)
}

struct Ring {
    samples: Vec<f32>,
    cursor: usize,
    latest: f32,
}

/// Fixed-capacity circular buffer of amplitude samples.
///
/// `push` overwrites the oldest entry and never blocks beyond one short lock;
/// `snapshot` returns an independent copy ordered oldest first.
pub struct AmplitudeRingBuffer {
    ring: Mutex<Ring>,
}

impl AmplitudeRingBuffer {
    /// Create a buffer holding `capacity` samples (at least one), all zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                samples: vec![0.0; capacity],
                cursor: 0,
                latest: 0.0,
            }),
        }
    }

    pub fn push(&self, sample: f32) {
        let mut ring = self.ring.lock();
        let cursor = ring.cursor;
        ring.samples[cursor] = sample;
        ring.cursor = (cursor + 1) % ring.samples.len();
        ring.latest = sample;
    }

    /// All N samples in chronological order (oldest first).
    pub fn snapshot(&self) -> Vec<f32> {
        let ring = self.ring.lock();
        let (newer, older) = ring.samples.split_at(ring.cursor);
        let mut out = Vec::with_capacity(ring.samples.len());
        out.extend_from_slice(older);
        out.extend_from_slice(newer);
        out
    }

    /// Most recently pushed sample, 0.0 before the first push.
    pub fn latest(&self) -> f32 {
        self.ring.lock().latest
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().samples.len()
    }

    /// Reset every slot to silence.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.samples.iter_mut().for_each(|s| *s = 0.0);
        ring.cursor = 0;
        ring.latest = 0.0;
    }
}

impl Default for AmplitudeRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_keeps_most_recent_in_order() {
        let buffer = AmplitudeRingBuffer::new(4);
        for k in 0..4 {
            for i in 0..(4 + k) {
                buffer.push(i as f32);
            }
            let snapshot = buffer.snapshot();
            assert_eq!(snapshot.len(), 4);
            let expected: Vec<f32> = (k..4 + k).map(|i| i as f32).collect();
            assert_eq!(snapshot, expected);
            buffer.clear();
        }
    }

    #[test]
    fn test_partial_fill_is_zero_padded_at_front() {
        let buffer = AmplitudeRingBuffer::new(5);
        buffer.push(0.25);
        buffer.push(0.5);
        assert_eq!(buffer.snapshot(), vec![0.0, 0.0, 0.0, 0.25, 0.5]);
        assert_eq!(buffer.latest(), 0.5);
    }

    #[test]
    fn test_zero_capacity_is_floored() {
        let buffer = AmplitudeRingBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push(0.7);
        buffer.push(0.9);
        assert_eq!(buffer.snapshot(), vec![0.9]);
    }

    #[test]
    fn test_concurrent_push_and_snapshot() {
        let buffer = Arc::new(AmplitudeRingBuffer::new(DEFAULT_CAPACITY));
        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    buffer.push((i % 100) as f32 / 100.0);
                }
            })
        };

        for _ in 0..1_000 {
            let snapshot = buffer.snapshot();
            assert_eq!(snapshot.len(), DEFAULT_CAPACITY);
            assert!(snapshot.iter().all(|s| (0.0..=1.0).contains(s)));
        }

        writer.join().unwrap();
        assert_eq!(buffer.latest(), 0.99);
    }

    #[test]
    fn test_rms_silence_and_full_scale() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0; 256]), 0.0);

        let full = rms_level(&[i16::MAX; 256]);
        assert!(full >= 0.99 && full <= 1.0, "got {}", full);

        // i16::MIN is slightly beyond full scale and must clamp
        assert_eq!(rms_level(&[i16::MIN; 8]), 1.0);
    }

    #[test]
    fn test_rms_half_scale_sine() {
        let samples: Vec<i16> = (0..1600)
            .map(|i| ((i as f32 / 16.0).sin() * 16_384.0) as i16)
            .collect();
        let level = rms_level(&samples);
        // RMS of a sine is peak / sqrt(2)
        assert!((level - 0.5 / 2f32.sqrt()).abs() < 0.02, "got {}", level);
    }
}
