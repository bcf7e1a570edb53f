//! The sliding audio buffer.

use verbatim_core::audio::{samples_to_secs, secs_to_samples};

/// Audio samples plus the absolute session time of sample index 0.
///
/// `absolute_time(i) = time_offset + i / 16000`. Only the engine mutates the
/// buffer; trimming drops leading samples and advances the offset in one
/// step so the invariant never breaks between the two.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    time_offset: f64,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Session time of sample index 0.
    pub fn time_offset(&self) -> f64 {
        self.time_offset
    }

    pub fn duration_secs(&self) -> f64 {
        samples_to_secs(self.samples.len())
    }

    /// Session time one past the last buffered sample.
    pub fn end_time(&self) -> f64 {
        self.time_offset + self.duration_secs()
    }

    /// Drop all samples with absolute time before `t` and advance the
    /// offset to `t`. Returns the number of samples dropped.
    pub fn trim_to(&mut self, t: f64) -> usize {
        let cut_secs = t - self.time_offset;
        if cut_secs <= 0.0 {
            return 0;
        }

        let cut = secs_to_samples(cut_secs).min(self.samples.len());
        self.samples.drain(..cut);
        self.time_offset = t;
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_duration() {
        let mut buffer = AudioBuffer::new();
        buffer.push(&vec![0.0; 16_000]);
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
        assert!((buffer.end_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn trim_advances_offset_and_drops_samples() {
        let mut buffer = AudioBuffer::new();
        buffer.push(&vec![0.0; 32_000]);

        let dropped = buffer.trim_to(1.0);
        assert_eq!(dropped, 16_000);
        assert!((buffer.time_offset() - 1.0).abs() < 1e-9);
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
        assert!((buffer.end_time() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn trim_before_offset_is_a_no_op() {
        let mut buffer = AudioBuffer::new();
        buffer.push(&vec![0.0; 16_000]);
        buffer.trim_to(0.5);
        assert_eq!(buffer.trim_to(0.25), 0);
        assert!((buffer.time_offset() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn trim_past_end_empties_the_buffer() {
        let mut buffer = AudioBuffer::new();
        buffer.push(&vec![0.0; 8_000]);
        buffer.trim_to(2.0);
        assert!(buffer.is_empty());
        assert!((buffer.time_offset() - 2.0).abs() < 1e-9);
    }
}
