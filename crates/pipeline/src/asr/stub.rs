//! Deterministic stub recognizer.
//!
//! Emits one pseudo-word per voiced region of the window, with timings that
//! are a pure function of the audio. Two calls over the same samples agree,
//! so the LocalAgreement machinery commits exactly as it would with a real
//! model. Used for smoke runs (`--backend stub`) and end-to-end tests that
//! must not depend on model files or the network.

use async_trait::async_trait;

use verbatim_core::{Hypothesis, Word};

use super::{AsrError, Capabilities, Transcriber};
use crate::vad::{EnergyGate, SpeechGate, VadKind};

pub struct StubTranscriber {
    gate: EnergyGate,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self {
            gate: EnergyGate::with_parts(30, -45.0, 0.3),
        }
    }
}

impl Default for StubTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        audio: &[f32],
        _prompt: &str,
        _language: Option<&str>,
    ) -> Result<Hypothesis, AsrError> {
        let intervals = self
            .gate
            .classify(audio)
            .map_err(|e| AsrError::Transient(e.to_string()))?;

        let mut words = Vec::new();
        for (index, interval) in intervals
            .iter()
            .filter(|iv| iv.kind == VadKind::Speech)
            .enumerate()
        {
            words.push(Word::new(
                interval.start,
                interval.end,
                format!("utt{index}"),
            ));
        }

        Ok(words)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_prompt: false,
            concurrent_safe: true,
            ..Capabilities::default()
        }
    }
}
