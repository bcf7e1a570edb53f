//! OpenAI-compatible transcription API backend.
//!
//! Uploads the audio window as an in-memory WAV and asks for `verbose_json`
//! with word-level timestamps. When the service only returns segment-level
//! timings the words are interpolated here, so the engine always sees a
//! word-level hypothesis.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use verbatim_core::{Hypothesis, Word, SAMPLE_RATE};

use super::{words_from_segment, AsrError, Capabilities, Transcriber};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Threshold above which a segment is considered non-speech and dropped.
const NO_SPEECH_PROB: f64 = 0.9;

pub struct OpenAiTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiTranscriber {
    /// Construction never fails: a missing key or unreachable endpoint only
    /// shows up per call, as `Unavailable`, so the server keeps accepting.
    pub fn new(model: &str) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY is not set; api backend calls will fail");
        }

        let endpoint =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default reqwest client");

        Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key,
        }
    }

    fn form(&self, audio: &[f32], prompt: &str, language: Option<&str>) -> Result<Form, AsrError> {
        let wav = encode_wav(audio)?;
        let file = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| AsrError::Transient(format!("multipart: {e}")))?;

        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word")
            .part("file", file);

        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }
        if !prompt.is_empty() {
            form = form.text("prompt", prompt.to_string());
        }

        Ok(form)
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        audio: &[f32],
        prompt: &str,
        language: Option<&str>,
    ) -> Result<Hypothesis, AsrError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AsrError::Unavailable("OPENAI_API_KEY is not set".to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .multipart(self.form(audio, prompt, language)?)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    AsrError::Unavailable(format!("cannot reach {}: {e}", self.endpoint))
                } else {
                    AsrError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AsrError::Unavailable(format!(
                "transcription API rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(AsrError::Transient(format!(
                "transcription API returned {status}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AsrError::Transient(format!("bad response body: {e}")))?;

        Ok(parse_hypothesis(&payload, audio.len()))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            concurrent_safe: true,
            ..Capabilities::default()
        }
    }
}

fn parse_hypothesis(payload: &serde_json::Value, audio_len: usize) -> Hypothesis {
    if let Some(words) = payload.get("words").and_then(|w| w.as_array()) {
        return words
            .iter()
            .filter_map(|w| {
                let text = w.get("word")?.as_str()?;
                let start = w.get("start")?.as_f64()?;
                let end = w.get("end")?.as_f64()?;
                Some(Word::new(start, end, text))
            })
            .collect();
    }

    if let Some(segments) = payload.get("segments").and_then(|s| s.as_array()) {
        let mut words = Vec::new();
        for segment in segments {
            let no_speech = segment
                .get("no_speech_prob")
                .and_then(|p| p.as_f64())
                .unwrap_or(0.0);
            if no_speech > NO_SPEECH_PROB {
                continue;
            }
            let (Some(start), Some(end), Some(text)) = (
                segment.get("start").and_then(|v| v.as_f64()),
                segment.get("end").and_then(|v| v.as_f64()),
                segment.get("text").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            words.extend(words_from_segment(text, start, end));
        }
        return words;
    }

    // Plain-text fallback: spread the transcript over the whole window.
    if let Some(text) = payload.get("text").and_then(|t| t.as_str()) {
        let window_secs = audio_len as f64 / SAMPLE_RATE as f64;
        return words_from_segment(text, 0.0, window_secs);
    }

    Vec::new()
}

fn encode_wav(audio: &[f32]) -> Result<Vec<u8>, AsrError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AsrError::Transient(format!("wav encode: {e}")))?;
        for sample in audio {
            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer
                .write_sample(value)
                .map_err(|e| AsrError::Transient(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AsrError::Transient(format!("wav encode: {e}")))?;
    }

    Ok(cursor.into_inner())
}
