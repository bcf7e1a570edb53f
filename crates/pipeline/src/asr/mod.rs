//! Recognizer abstraction and backend variants.
//!
//! The engine only ever sees the narrow [`Transcriber`] interface: one call
//! that turns an audio window plus a textual context prompt into word-level
//! timed output. Backend selection is a construction-time choice made by
//! [`create_transcriber`]; the loaded model is shared process-wide and
//! injected into every session.

mod openai;
mod pool;
mod stub;
#[cfg(feature = "whisper-cpp")]
mod whisper_cpp;

pub use openai::OpenAiTranscriber;
pub use pool::PooledTranscriber;
pub use stub::StubTranscriber;
#[cfg(feature = "whisper-cpp")]
pub use whisper_cpp::WhisperCppTranscriber;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use verbatim_config::{AsrBackend, AsrConfig};
use verbatim_core::{Hypothesis, Word, SAMPLE_RATE};

/// Recognizer errors
#[derive(Error, Debug)]
pub enum AsrError {
    /// The backend cannot be reached or cannot load its model. Fatal to the
    /// session; the server stays up.
    #[error("recognizer unavailable: {0}")]
    Unavailable(String),

    /// A single call failed. The engine treats this as "no new words this
    /// tick" and it never reaches the client.
    #[error("transient recognizer failure: {0}")]
    Transient(String),
}

/// Static capability set of a backend.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Sample rate the backend expects. The engine works at 16 kHz.
    pub sample_rate: u32,
    /// Longest audio window a single call accepts.
    pub max_audio_secs: f32,
    /// Whether the backend consumes the context prompt.
    pub supports_prompt: bool,
    /// Whether concurrent calls on one instance are safe.
    pub concurrent_safe: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            max_audio_secs: 30.0,
            supports_prompt: true,
            concurrent_safe: false,
        }
    }
}

/// A pluggable offline recognizer.
///
/// `audio` is 16 kHz mono f32; word times in the returned hypothesis are
/// relative to the start of `audio` and non-decreasing. The adapter holds
/// model weights but no per-session state.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[f32],
        prompt: &str,
        language: Option<&str>,
    ) -> Result<Hypothesis, AsrError>;

    fn capabilities(&self) -> Capabilities;
}

/// Build the configured backend, wrapped in the process-wide call pool.
///
/// Construction failures (unknown model path, backend compiled out) are
/// reported as `Unavailable` and abort startup; backends whose failures only
/// show up per call construct fine and surface errors through the session.
pub fn create_transcriber(config: &AsrConfig) -> Result<Arc<dyn Transcriber>, AsrError> {
    let inner: Arc<dyn Transcriber> = match config.backend {
        AsrBackend::Stub => Arc::new(StubTranscriber::new()),
        AsrBackend::Api => Arc::new(OpenAiTranscriber::new(&config.model)),
        AsrBackend::Cpu | AsrBackend::Cuda | AsrBackend::Metal => {
            local_backend(config)?
        }
    };

    Ok(Arc::new(PooledTranscriber::new(inner)))
}

#[cfg(feature = "whisper-cpp")]
fn local_backend(config: &AsrConfig) -> Result<Arc<dyn Transcriber>, AsrError> {
    let use_gpu = !matches!(config.backend, AsrBackend::Cpu);
    Ok(Arc::new(WhisperCppTranscriber::load(&config.model, use_gpu)?))
}

#[cfg(not(feature = "whisper-cpp"))]
fn local_backend(config: &AsrConfig) -> Result<Arc<dyn Transcriber>, AsrError> {
    Err(AsrError::Unavailable(format!(
        "backend '{}' requires the whisper-cpp feature",
        config.backend.as_str()
    )))
}

/// Split segment-level output into word-level entries.
///
/// Some backends only produce segment timings; the adapter (not the engine)
/// interpolates linearly across the segment's declared duration, apportioning
/// time to whitespace tokens by character length.
pub fn words_from_segment(text: &str, start: f64, end: f64) -> Vec<Word> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let span = (end - start).max(0.0);
    let total_chars: usize = tokens.iter().map(|t| t.len()).sum();
    if total_chars == 0 {
        return Vec::new();
    }

    let mut words = Vec::with_capacity(tokens.len());
    let mut cursor = start;
    for token in &tokens {
        let width = span * token.len() as f64 / total_chars as f64;
        words.push(Word::new(cursor, cursor + width, *token));
        cursor += width;
    }

    // Rounding drift lands on the last word.
    if let Some(last) = words.last_mut() {
        last.end = end.max(last.start);
    }

    words
}
