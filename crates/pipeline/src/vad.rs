//! Voice activity detection.
//!
//! The gate is advisory: it only tells the engine where it is safe to trim
//! the audio buffer. If it disagrees with the recognizer about where a word
//! lies, the recognizer wins, and a gate failure just means the whole window
//! is treated as speech.

use thiserror::Error;

use verbatim_core::audio::{samples_to_secs, SAMPLE_RATE};
use verbatim_config::VadConfig;

/// VAD errors
#[derive(Error, Debug)]
pub enum VadError {
    #[error("vad failure: {0}")]
    Failed(String),
}

/// Classification of one contiguous stretch of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadKind {
    Speech,
    Silence,
}

/// A classified interval, in seconds relative to the input's first sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadInterval {
    pub start: f64,
    pub end: f64,
    pub kind: VadKind,
}

impl VadInterval {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Pluggable speech/silence classifier.
///
/// Output intervals are contiguous and cover the input exactly. Silence
/// intervals shorter than the configured minimum are merged into adjacent
/// speech before they are returned.
pub trait SpeechGate: Send + Sync {
    fn classify(&self, audio: &[f32]) -> Result<Vec<VadInterval>, VadError>;
}

/// Frame-RMS energy gate.
///
/// Frames whose RMS level falls below the floor are silence. This is the
/// same mechanism the local dictation daemons in this space use; it needs no
/// model and is cheap enough to run on the full buffer every engine tick.
pub struct EnergyGate {
    frame_len: usize,
    floor_db: f32,
    min_silence: f64,
}

impl EnergyGate {
    pub fn new(config: &VadConfig) -> Self {
        Self::with_parts(
            config.frame_ms,
            config.energy_floor_db,
            config.min_silence_secs,
        )
    }

    pub fn with_parts(frame_ms: u32, floor_db: f32, min_silence: f64) -> Self {
        let frame_len = (frame_ms as usize * SAMPLE_RATE as usize / 1000).max(1);
        Self {
            frame_len,
            floor_db,
            min_silence,
        }
    }

    fn frame_is_speech(&self, frame: &[f32]) -> bool {
        rms_db(frame) > self.floor_db
    }
}

impl SpeechGate for EnergyGate {
    fn classify(&self, audio: &[f32]) -> Result<Vec<VadInterval>, VadError> {
        if audio.is_empty() {
            return Ok(Vec::new());
        }

        let mut intervals: Vec<VadInterval> = Vec::new();
        let mut pos = 0usize;

        while pos < audio.len() {
            let end = (pos + self.frame_len).min(audio.len());
            let kind = if self.frame_is_speech(&audio[pos..end]) {
                VadKind::Speech
            } else {
                VadKind::Silence
            };

            match intervals.last_mut() {
                Some(last) if last.kind == kind => last.end = samples_to_secs(end),
                _ => intervals.push(VadInterval {
                    start: samples_to_secs(pos),
                    end: samples_to_secs(end),
                    kind,
                }),
            }
            pos = end;
        }

        Ok(merge_short_silences(intervals, self.min_silence))
    }
}

/// Merge silence intervals shorter than `min_silence` into adjacent speech.
///
/// A window without any speech is left alone: there is nothing to merge into.
fn merge_short_silences(intervals: Vec<VadInterval>, min_silence: f64) -> Vec<VadInterval> {
    let has_speech = intervals.iter().any(|iv| iv.kind == VadKind::Speech);
    if !has_speech {
        return intervals;
    }

    let mut merged: Vec<VadInterval> = Vec::with_capacity(intervals.len());
    for mut interval in intervals {
        if interval.kind == VadKind::Silence && interval.duration() < min_silence {
            interval.kind = VadKind::Speech;
        }
        match merged.last_mut() {
            Some(last) if last.kind == interval.kind => last.end = interval.end,
            _ => merged.push(interval),
        }
    }
    merged
}

fn rms_db(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let energy: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    let rms = energy.sqrt();
    20.0 * rms.max(1e-10).log10()
}
