//! The online reconciliation engine.
//!
//! Turns repeated offline recognizer calls over a growing (then trimmed)
//! audio window into an append-only committed transcript. A word is only
//! committed once two consecutive hypotheses agree on it at the same
//! absolute time (LocalAgreement-2); the buffer is trimmed at VAD silence or
//! committed-sentence boundaries so it stays bounded.

mod audio_buffer;
mod hypothesis;

pub use audio_buffer::AudioBuffer;
pub use hypothesis::HypothesisBuffer;

use std::sync::Arc;

use thiserror::Error;

use verbatim_config::{EngineConfig, TrimPolicy, VadConfig};
use verbatim_core::Word;

use crate::asr::{AsrError, Transcriber};
use crate::vad::{EnergyGate, SpeechGate, VadKind};

/// Tail kept when trimming a buffer with nothing committed yet, in case a
/// speech onset hides at the very end of the silence.
const SILENCE_KEEP_TAIL_SECS: f64 = 1.0;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// `process_iter` or `finish` after `finish` — a programming error.
    #[error("engine is closed")]
    Closed,

    /// The recognizer cannot serve this session at all. Transient failures
    /// never surface here; they are absorbed as an empty tick.
    #[error(transparent)]
    Recognizer(#[from] AsrError),
}

/// Per-session streaming transcription state.
///
/// Owned by exactly one task; none of the state is shared, so there are no
/// locks here. The recognizer handle is the process-wide pooled instance.
pub struct OnlineEngine {
    asr: Arc<dyn Transcriber>,
    gate: Option<Box<dyn SpeechGate>>,
    cfg: EngineConfig,
    min_silence: f64,
    language: Option<String>,
    buffer: AudioBuffer,
    hyp: HypothesisBuffer,
    committed: Vec<Word>,
    closed: bool,
}

impl OnlineEngine {
    pub fn new(
        asr: Arc<dyn Transcriber>,
        engine: EngineConfig,
        vad: VadConfig,
        language: Option<String>,
    ) -> Self {
        let gate: Option<Box<dyn SpeechGate>> = if vad.enabled {
            Some(Box::new(EnergyGate::new(&vad)))
        } else {
            None
        };
        Self::with_gate(asr, gate, engine, vad.min_silence_secs, language)
    }

    pub fn with_gate(
        asr: Arc<dyn Transcriber>,
        gate: Option<Box<dyn SpeechGate>>,
        cfg: EngineConfig,
        min_silence: f64,
        language: Option<String>,
    ) -> Self {
        Self {
            asr,
            gate,
            cfg,
            min_silence,
            language,
            buffer: AudioBuffer::new(),
            hyp: HypothesisBuffer::new(),
            committed: Vec::new(),
            closed: false,
        }
    }

    /// Append samples to the audio buffer. No recognition side effect.
    pub fn insert_audio(&mut self, samples: &[f32]) {
        if self.closed {
            tracing::trace!("audio after finish; dropping");
            return;
        }
        self.buffer.push(samples);
    }

    /// Whether any audio is buffered.
    pub fn has_audio(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffer_seconds(&self) -> f64 {
        self.buffer.duration_secs()
    }

    pub fn time_offset(&self) -> f64 {
        self.buffer.time_offset()
    }

    pub fn committed(&self) -> &[Word] {
        &self.committed
    }

    pub fn last_committed_end(&self) -> Option<f64> {
        self.committed.last().map(|w| w.end)
    }

    /// Recognize on the current buffer, reconcile against the previous
    /// hypothesis, trim, and return the newly committed words.
    pub async fn process_iter(&mut self) -> Result<Vec<Word>, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self.recognize_once().await?;
        self.trim_buffer();
        Ok(committed)
    }

    /// End of stream: one final recognition pass, then flush everything
    /// still unconfirmed — no second opinion can ever arrive.
    pub async fn finish(&mut self) -> Result<Vec<Word>, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }

        let mut out = if self.buffer.is_empty() {
            Vec::new()
        } else {
            self.recognize_once().await?
        };

        let rest = self.hyp.take_pending();
        if !rest.is_empty() {
            tracing::debug!(words = rest.len(), "flushing unconfirmed tail at finish");
            self.committed.extend(rest.iter().cloned());
            out.extend(rest);
        }

        let end = self.buffer.end_time();
        self.buffer.trim_to(end);
        self.closed = true;
        Ok(out)
    }

    async fn recognize_once(&mut self) -> Result<Vec<Word>, EngineError> {
        let prompt = build_prompt(&self.committed, self.buffer.time_offset(), self.cfg.prompt_chars);
        tracing::trace!(
            window_secs = self.buffer.duration_secs(),
            offset = self.buffer.time_offset(),
            prompt_chars = prompt.len(),
            "recognizing"
        );

        let hypothesis = match self
            .asr
            .transcribe(self.buffer.samples(), &prompt, self.language.as_deref())
            .await
        {
            Ok(hypothesis) => hypothesis,
            Err(AsrError::Transient(reason)) => {
                tracing::debug!(%reason, "transient recognizer failure; no words this tick");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let tail_start = self.committed.len().saturating_sub(5);
        self.hyp
            .insert(hypothesis, self.buffer.time_offset(), &self.committed[tail_start..]);

        let committed = self.hyp.agree();
        if !committed.is_empty() {
            tracing::debug!(
                words = committed.len(),
                up_to = committed.last().map(|w| w.end),
                "committed words"
            );
            self.committed.extend(committed.iter().cloned());
        }

        Ok(committed)
    }

    /// Trim decision, run after every recognition pass.
    fn trim_buffer(&mut self) {
        let cut = match self.cfg.trimming {
            TrimPolicy::Segment => self.silence_cut(),
            TrimPolicy::Sentence => self.sentence_cut(),
        };

        if let Some(t) = cut {
            if t > self.buffer.time_offset() + 1e-6 {
                tracing::debug!(at = t, "trimming buffer at boundary");
                self.cut_at(t);
            }
        }

        if self.buffer.duration_secs() > self.cfg.buffer_cap_secs {
            let target =
                self.buffer.time_offset() + self.cfg.buffer_cap_secs - self.cfg.trim_margin_secs;
            let t = match self.last_committed_end() {
                Some(safe) => target.min(safe),
                None => target,
            };
            if t > self.buffer.time_offset() + 1e-6 {
                tracing::warn!(
                    at = t,
                    buffer_secs = self.buffer.duration_secs(),
                    "audio buffer exceeded the hard cap; cutting mid-utterance"
                );
                self.cut_at(t);
            } else {
                tracing::debug!("buffer over the hard cap with no committed point to cut at");
            }
        }
    }

    /// Latest VAD silence boundary that is safe to cut at.
    fn silence_cut(&self) -> Option<f64> {
        let gate = self.gate.as_ref()?;
        let intervals = match gate.classify(self.buffer.samples()) {
            Ok(intervals) => intervals,
            Err(err) => {
                tracing::debug!(error = %err, "vad failed; treating the window as speech");
                return None;
            }
        };

        let offset = self.buffer.time_offset();
        let safe_until = self.last_committed_end();
        let pending_floor = self.hyp.pending().first().map(|w| w.start);
        let buffer_end = self.buffer.end_time();

        let mut best: Option<f64> = None;
        for interval in intervals
            .iter()
            .filter(|iv| iv.kind == VadKind::Silence && iv.duration() >= self.min_silence)
        {
            let mut t = offset + interval.end;
            match safe_until {
                Some(safe) => {
                    if t > safe {
                        continue;
                    }
                }
                None => {
                    // Nothing committed yet, so the silence overlaps no
                    // transcript; keep a short tail in case a speech onset
                    // hides at its very end.
                    if t >= buffer_end - 1e-6 {
                        t -= SILENCE_KEEP_TAIL_SECS;
                    }
                    if let Some(floor) = pending_floor {
                        if t > floor {
                            continue;
                        }
                    }
                }
            }
            if t > offset + 1e-6 {
                best = Some(best.map_or(t, |b: f64| b.max(t)));
            }
        }
        best
    }

    /// End of the second-to-last completed sentence of the committed text.
    fn sentence_cut(&self) -> Option<f64> {
        let offset = self.buffer.time_offset();
        let ends: Vec<f64> = self
            .committed
            .iter()
            .filter(|w| {
                let t = w.text.trim_end();
                t.ends_with('.') || t.ends_with('!') || t.ends_with('?')
            })
            .map(|w| w.end)
            .filter(|e| *e > offset)
            .collect();

        if ends.len() < 2 {
            return None;
        }
        Some(ends[ends.len() - 2])
    }

    fn cut_at(&mut self, t: f64) {
        self.buffer.trim_to(t);
        self.hyp.drop_before(t);
    }
}

/// The recognizer prompt: a suffix of the committed words that have scrolled
/// out of the audio buffer, at most `max_chars` characters, cut at a word
/// boundary. Committed words still inside the buffer are re-transcribed and
/// skipped, so they must not appear in the prompt.
fn build_prompt(committed: &[Word], offset: f64, max_chars: usize) -> String {
    let mut k = committed.len();
    while k > 0 && committed[k - 1].end > offset {
        k -= 1;
    }

    let mut parts: Vec<&str> = Vec::new();
    let mut len = 0;
    for word in committed[..k].iter().rev() {
        let token = word.text.trim();
        if token.is_empty() {
            continue;
        }
        if len + token.len() + 1 > max_chars {
            break;
        }
        len += token.len() + 1;
        parts.push(token);
    }
    parts.reverse();
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::asr::Capabilities;
    use verbatim_core::{Hypothesis, SAMPLE_RATE};

    /// Replays a fixed list of hypotheses, one per call; the last entry
    /// repeats once the script runs out. Records the prompts it was given.
    struct ScriptedTranscriber {
        calls: AtomicUsize,
        scripts: Vec<Result<Hypothesis, String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedTranscriber {
        fn new(scripts: Vec<Result<Hypothesis, String>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                scripts,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn ok(scripts: Vec<Hypothesis>) -> Arc<Self> {
            Self::new(scripts.into_iter().map(Ok).collect())
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(
            &self,
            _audio: &[f32],
            prompt: &str,
            _language: Option<&str>,
        ) -> Result<Hypothesis, AsrError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let index = call.min(self.scripts.len() - 1);
            match &self.scripts[index] {
                Ok(words) => Ok(words.clone()),
                Err(reason) => Err(AsrError::Transient(reason.clone())),
            }
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                concurrent_safe: true,
                ..Capabilities::default()
            }
        }
    }

    fn word(start: f64, end: f64, text: &str) -> Word {
        Word::new(start, end, text)
    }

    fn engine_with(asr: Arc<dyn Transcriber>, cfg: EngineConfig) -> OnlineEngine {
        OnlineEngine::with_gate(asr, None, cfg, 0.5, None)
    }

    fn loud(secs: f64) -> Vec<f32> {
        vec![0.3; (secs * SAMPLE_RATE as f64) as usize]
    }

    fn quiet(secs: f64) -> Vec<f32> {
        vec![0.0; (secs * SAMPLE_RATE_F) as usize]
    }

    const SAMPLE_RATE_F: f64 = SAMPLE_RATE as f64;

    #[tokio::test]
    async fn commits_after_two_agreeing_calls() {
        let hyp = vec![word(0.2, 0.6, "hello"), word(0.7, 1.2, "world")];
        let asr = ScriptedTranscriber::ok(vec![hyp.clone(), hyp]);
        let mut engine = engine_with(asr, EngineConfig::default());

        engine.insert_audio(&loud(1.5));
        assert!(engine.process_iter().await.unwrap().is_empty());

        engine.insert_audio(&loud(0.5));
        let committed = engine.process_iter().await.unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[1].text, "world");
        assert_eq!(engine.committed().len(), 2);
        assert!((engine.last_committed_end().unwrap() - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_buffer_is_a_quiet_tick() {
        let asr = ScriptedTranscriber::ok(vec![vec![]]);
        let mut engine = engine_with(asr.clone(), EngineConfig::default());
        assert!(engine.process_iter().await.unwrap().is_empty());
        // No audio, no recognizer call.
        assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_an_empty_tick() {
        let hyp = vec![word(0.1, 0.5, "hi")];
        let asr = ScriptedTranscriber::new(vec![
            Err("timeout".to_string()),
            Ok(hyp.clone()),
            Ok(hyp),
        ]);
        let mut engine = engine_with(asr, EngineConfig::default());

        engine.insert_audio(&loud(1.0));
        assert!(engine.process_iter().await.unwrap().is_empty());
        assert!(engine.process_iter().await.unwrap().is_empty());
        let committed = engine.process_iter().await.unwrap();
        assert_eq!(committed.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_propagates() {
        struct DownTranscriber;

        #[async_trait]
        impl Transcriber for DownTranscriber {
            async fn transcribe(
                &self,
                _audio: &[f32],
                _prompt: &str,
                _language: Option<&str>,
            ) -> Result<Hypothesis, AsrError> {
                Err(AsrError::Unavailable("model missing".to_string()))
            }

            fn capabilities(&self) -> Capabilities {
                Capabilities::default()
            }
        }

        let mut engine = engine_with(Arc::new(DownTranscriber), EngineConfig::default());
        engine.insert_audio(&loud(1.0));
        assert!(matches!(
            engine.process_iter().await,
            Err(EngineError::Recognizer(AsrError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn identical_hypothesis_never_commits_twice() {
        let hyp = vec![word(0.2, 0.6, "hello"), word(0.7, 1.2, "world")];
        let asr = ScriptedTranscriber::ok(vec![hyp]);
        let mut engine = engine_with(asr, EngineConfig::default());

        engine.insert_audio(&loud(1.5));
        engine.process_iter().await.unwrap();
        let committed = engine.process_iter().await.unwrap();
        assert_eq!(committed.len(), 2);

        // Same hypothesis again, no new audio: nothing more to commit.
        assert!(engine.process_iter().await.unwrap().is_empty());
        assert!(engine.process_iter().await.unwrap().is_empty());
        assert_eq!(engine.committed().len(), 2);
    }

    #[tokio::test]
    async fn trims_at_silence_inside_committed_region() {
        // 1 s speech, 1 s silence, 1 s speech.
        let mut audio = loud(1.0);
        audio.extend(quiet(1.0));
        audio.extend(loud(1.0));

        let first = vec![word(0.1, 0.9, "hello")];
        let both = vec![word(0.1, 0.9, "hello"), word(2.1, 2.9, "world")];
        let asr = ScriptedTranscriber::ok(vec![first.clone(), first, both.clone(), both]);

        let gate: Option<Box<dyn SpeechGate>> =
            Some(Box::new(EnergyGate::with_parts(30, -45.0, 0.5)));
        let mut engine =
            OnlineEngine::with_gate(asr, gate, EngineConfig::default(), 0.5, None);

        engine.insert_audio(&audio);
        engine.process_iter().await.unwrap();
        engine.process_iter().await.unwrap(); // commits "hello"
        engine.process_iter().await.unwrap();
        let committed = engine.process_iter().await.unwrap(); // commits "world"
        assert_eq!(committed.len(), 1);

        // The silence ends near 2.0 (frame-quantized), inside the committed
        // span (world ends at 2.9), so the buffer was cut there.
        assert!((engine.time_offset() - 2.0).abs() < 0.1);
        assert!(engine.time_offset() <= engine.last_committed_end().unwrap());
        assert!((engine.buffer_seconds() - 1.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn pure_silence_stays_bounded() {
        let asr = ScriptedTranscriber::ok(vec![vec![]]);
        let gate: Option<Box<dyn SpeechGate>> =
            Some(Box::new(EnergyGate::with_parts(30, -45.0, 0.5)));
        let mut engine =
            OnlineEngine::with_gate(asr, gate, EngineConfig::default(), 0.5, None);

        for _ in 0..60 {
            engine.insert_audio(&quiet(1.0));
            let committed = engine.process_iter().await.unwrap();
            assert!(committed.is_empty());
            assert!(engine.buffer_seconds() <= EngineConfig::default().buffer_cap_secs + 5.0);
        }
        // Silence trimming keeps only a short tail.
        assert!(engine.buffer_seconds() <= 2.0);
    }

    #[tokio::test]
    async fn hard_cap_cuts_without_commitments() {
        let cfg = EngineConfig {
            buffer_cap_secs: 2.0,
            trim_margin_secs: 1.0,
            ..EngineConfig::default()
        };
        let asr = ScriptedTranscriber::ok(vec![vec![]]);
        let mut engine = engine_with(asr, cfg);

        engine.insert_audio(&loud(4.0));
        engine.process_iter().await.unwrap();
        assert!((engine.time_offset() - 1.0).abs() < 1e-6);
        engine.process_iter().await.unwrap();
        assert!((engine.time_offset() - 2.0).abs() < 1e-6);
        assert!(engine.buffer_seconds() <= 2.0 + 1e-6);
    }

    #[tokio::test]
    async fn hard_cap_cut_never_passes_committed_end() {
        let cfg = EngineConfig {
            buffer_cap_secs: 2.0,
            trim_margin_secs: 1.0,
            ..EngineConfig::default()
        };
        let hyp = vec![word(0.1, 0.9, "hello")];
        let asr = ScriptedTranscriber::ok(vec![hyp.clone(), hyp]);
        let mut engine = engine_with(asr, cfg);

        engine.insert_audio(&loud(1.5));
        engine.process_iter().await.unwrap();
        let committed = engine.process_iter().await.unwrap();
        assert_eq!(committed.len(), 1);

        engine.insert_audio(&loud(2.5));
        engine.process_iter().await.unwrap();
        // target would be offset + 1.0, but the committed end (0.9) caps it.
        assert!((engine.time_offset() - 0.9).abs() < 1e-6);
        assert!(engine.time_offset() <= engine.last_committed_end().unwrap());
    }

    #[tokio::test]
    async fn sentence_policy_cuts_at_second_to_last_sentence() {
        let cfg = EngineConfig {
            trimming: TrimPolicy::Sentence,
            ..EngineConfig::default()
        };
        let hyp = vec![
            word(0.2, 0.8, "One."),
            word(1.0, 1.6, "Two."),
            word(2.0, 2.6, "Three."),
        ];
        let asr = ScriptedTranscriber::ok(vec![hyp.clone(), hyp]);
        let mut engine = engine_with(asr, cfg);

        engine.insert_audio(&loud(3.0));
        engine.process_iter().await.unwrap();
        engine.process_iter().await.unwrap();

        // Three sentence ends committed; the cut lands on the second-to-last.
        assert!((engine.time_offset() - 1.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn chunking_cadence_does_not_change_committed_text() {
        // The same audio fed in 100 ms vs. 500 ms frames must commit the
        // same text; only the commit times may differ.
        async fn run(chunk: usize) -> String {
            let stub = Arc::new(crate::asr::StubTranscriber::new());
            let mut engine = engine_with(stub, EngineConfig::default());

            let mut audio = loud(1.0);
            audio.extend(quiet(0.8));
            audio.extend(loud(1.2));
            audio.extend(quiet(0.5));

            let mut fed = 0usize;
            for frame in audio.chunks(chunk) {
                engine.insert_audio(frame);
                fed += frame.len();
                if fed >= SAMPLE_RATE as usize {
                    fed = 0;
                    engine.process_iter().await.unwrap();
                }
            }
            engine.finish().await.unwrap();
            verbatim_core::word::join_words(engine.committed())
        }

        let fine = run(1_600).await;
        let coarse = run(8_000).await;
        assert_eq!(fine, coarse);
        assert!(!fine.is_empty());
    }

    #[tokio::test]
    async fn finish_flushes_the_unconfirmed_tail() {
        let hyp = vec![word(0.2, 0.6, "hello"), word(0.7, 1.2, "world")];
        let asr = ScriptedTranscriber::ok(vec![hyp]);
        let mut engine = engine_with(asr, EngineConfig::default());

        engine.insert_audio(&loud(1.5));
        engine.process_iter().await.unwrap();

        let flushed = engine.finish().await.unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(engine.committed().len(), 2);

        assert!(matches!(engine.finish().await, Err(EngineError::Closed)));
        assert!(matches!(
            engine.process_iter().await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn finish_on_empty_session_is_empty() {
        let asr = ScriptedTranscriber::ok(vec![vec![]]);
        let mut engine = engine_with(asr.clone(), EngineConfig::default());
        let flushed = engine.finish().await.unwrap();
        assert!(flushed.is_empty());
        assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompt_contains_only_scrolled_away_words() {
        // Commit "hello world", trim past it, then check the next prompt.
        let cfg = EngineConfig {
            buffer_cap_secs: 2.0,
            trim_margin_secs: 1.0,
            ..EngineConfig::default()
        };
        let hyp = vec![word(0.2, 0.6, "hello"), word(0.7, 0.85, "world")];
        let asr = ScriptedTranscriber::ok(vec![hyp.clone(), hyp]);
        let mut engine = engine_with(asr.clone(), cfg);

        engine.insert_audio(&loud(1.0));
        engine.process_iter().await.unwrap();
        engine.process_iter().await.unwrap();

        // Force a cap trim past the committed words.
        engine.insert_audio(&loud(2.0));
        engine.process_iter().await.unwrap();
        assert!((engine.time_offset() - 0.85).abs() < 1e-6);

        engine.insert_audio(&loud(0.5));
        engine.process_iter().await.unwrap();

        let prompts = asr.prompts.lock().unwrap();
        assert_eq!(prompts.last().unwrap(), "hello world");
    }

    #[test]
    fn prompt_respects_the_character_budget() {
        let committed: Vec<Word> = (0..100)
            .map(|i| word(i as f64, i as f64 + 0.5, &format!("word{i:03}")))
            .collect();
        let prompt = build_prompt(&committed, 1000.0, 200);
        assert!(prompt.len() <= 200);
        // The prompt is the most recent suffix.
        assert!(prompt.ends_with("word099"));
        // Cut at a word boundary, not mid-token.
        assert!(prompt.starts_with("word"));
    }

    #[test]
    fn prompt_skips_words_still_inside_the_buffer() {
        let committed = vec![word(0.0, 0.5, "gone"), word(5.0, 5.5, "present")];
        let prompt = build_prompt(&committed, 2.0, 200);
        assert_eq!(prompt, "gone");
    }
}
