//! Audio constants and PCM frame decoding.

/// The engine's working sample rate. All audio entering the pipeline is
/// little-endian 16-bit signed PCM, mono, at this rate.
pub const SAMPLE_RATE: u32 = 16_000;

/// Seconds of audio represented by `n` samples at the working rate.
pub fn samples_to_secs(n: usize) -> f64 {
    n as f64 / SAMPLE_RATE as f64
}

/// Number of samples in `secs` seconds at the working rate.
pub fn secs_to_samples(secs: f64) -> usize {
    (secs * SAMPLE_RATE as f64).round() as usize
}

/// Incremental decoder from raw i16le PCM bytes to normalized f32 samples.
///
/// Clients may write chunks of any size, so a chunk boundary can fall in the
/// middle of a sample. The decoder carries a trailing odd byte into the next
/// chunk instead of dropping it.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    pending: Option<u8>,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk of raw PCM bytes into f32 samples in [-1, 1].
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<f32> {
        if bytes.is_empty() {
            return Vec::new();
        }

        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;

        if let Some(lo) = self.pending.take() {
            let sample = i16::from_le_bytes([lo, rest[0]]);
            samples.push(sample as f32 / 32768.0);
            rest = &rest[1..];
        }

        let mut chunks = rest.chunks_exact(2);
        for chunk in &mut chunks {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            samples.push(sample as f32 / 32768.0);
        }

        if let [lo] = chunks.remainder() {
            self.pending = Some(*lo);
        }

        samples
    }
}
