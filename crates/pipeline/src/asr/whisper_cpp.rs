//! Local whisper.cpp backend.
//!
//! One context is loaded per process and shared across sessions; each call
//! gets its own decoding state. `use_gpu` selects the CUDA/Metal offload
//! variants, which otherwise behave identically to the CPU one. Word-level
//! timings come from token timestamps with one-word segments.

use std::sync::Arc;

use async_trait::async_trait;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use verbatim_core::{Hypothesis, Word};

use super::{AsrError, Capabilities, Transcriber};

pub struct WhisperCppTranscriber {
    context: Arc<WhisperContext>,
    threads: i32,
}

impl WhisperCppTranscriber {
    /// Load the model eagerly; a bad path or unreadable model aborts startup
    /// rather than surfacing on the first client.
    pub fn load(model_path: &str, use_gpu: bool) -> Result<Self, AsrError> {
        let mut params = WhisperContextParameters::default();
        params.use_gpu = use_gpu;

        tracing::info!(model = %model_path, use_gpu, "loading whisper model");
        let context = WhisperContext::new_with_params(model_path, params).map_err(|e| {
            AsrError::Unavailable(format!("cannot load whisper model {model_path}: {e}"))
        })?;

        Ok(Self {
            context: Arc::new(context),
            threads: (num_cpus::get() as i32 - 1).max(1),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperCppTranscriber {
    async fn transcribe(
        &self,
        audio: &[f32],
        prompt: &str,
        language: Option<&str>,
    ) -> Result<Hypothesis, AsrError> {
        let context = self.context.clone();
        let threads = self.threads;
        let audio = audio.to_vec();
        let prompt = prompt.to_string();
        let language = language.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let mut state = context
                .create_state()
                .map_err(|e| AsrError::Transient(format!("whisper state: {e}")))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);
            params.set_token_timestamps(true);
            params.set_max_len(1);
            params.set_split_on_word(true);
            params.set_n_threads(threads);
            params.set_language(language.as_deref());
            if !prompt.is_empty() {
                params.set_initial_prompt(&prompt);
            }

            state
                .full(params, &audio)
                .map_err(|e| AsrError::Transient(format!("whisper decode: {e}")))?;

            let count = state
                .full_n_segments()
                .map_err(|e| AsrError::Transient(format!("whisper segments: {e}")))?;

            let mut words = Vec::with_capacity(count as usize);
            for i in 0..count {
                let text = state
                    .full_get_segment_text(i)
                    .map_err(|e| AsrError::Transient(format!("whisper segment text: {e}")))?;
                if text.trim().is_empty() {
                    continue;
                }
                let start = state
                    .full_get_segment_t0(i)
                    .map_err(|e| AsrError::Transient(format!("whisper timestamps: {e}")))?
                    as f64
                    / 100.0;
                let end = state
                    .full_get_segment_t1(i)
                    .map_err(|e| AsrError::Transient(format!("whisper timestamps: {e}")))?
                    as f64
                    / 100.0;
                words.push(Word::new(start, end.max(start), text));
            }

            Ok(words)
        })
        .await
        .map_err(|e| AsrError::Transient(format!("whisper task: {e}")))?
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            // States are per call, but whisper.cpp saturates the cores on its
            // own; let the pool serialize calls on this instance.
            concurrent_safe: false,
            ..Capabilities::default()
        }
    }
}
