//! One client session: ingest, engine cadence, output.
//!
//! Two cooperating tasks per connection: a reader that pulls audio off the
//! transport as fast as it arrives, and this driver, which feeds the engine,
//! runs recognition on a cadence, and writes records. A bounded queue sits
//! between them so a slow recognizer never stalls the network reader long
//! enough for the client to see spurious silence.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use uuid::Uuid;

use verbatim_config::EngineConfig;
use verbatim_core::audio::samples_to_secs;
use verbatim_core::{PcmDecoder, TranscriptSegment, Word};
use verbatim_pipeline::{EngineError, OnlineEngine};

use crate::observability;
use crate::protocol::{AudioReader, RecordWriter};
use crate::SessionError;

/// WebSocket keepalive after this much outbound quiet.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence check resolution.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Frame queue between reader and driver, about 2 s at the typical 100 ms
/// client frame size.
const QUEUE_FRAMES: usize = 20;

/// Cadence parameters, taken from the engine section of the settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub min_chunk_secs: f64,
    pub max_wait_secs: f64,
}

impl From<&EngineConfig> for SessionParams {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            min_chunk_secs: cfg.min_chunk_secs,
            max_wait_secs: cfg.max_wait_secs,
        }
    }
}

enum ReaderEvent {
    Audio(Vec<f32>),
    Failed(SessionError),
}

enum Outcome {
    Finished,
    Errored(&'static str),
    TransportLost,
}

/// Run one session to completion. Consumes the transport halves; everything
/// the session allocated is released when this returns.
pub async fn run_session(
    id: Uuid,
    mut engine: OnlineEngine,
    reader: Box<dyn AudioReader>,
    mut writer: Box<dyn RecordWriter>,
    params: SessionParams,
) {
    tracing::info!(session = %id, "session started");
    observability::record_session_started();

    let (tx, rx) = mpsc::channel::<ReaderEvent>(QUEUE_FRAMES);
    let reader_task = tokio::spawn(read_loop(reader, tx));

    let outcome = Driver {
        id,
        engine: &mut engine,
        writer: writer.as_mut(),
        params,
        output: OutputState::default(),
        pending_secs: 0.0,
        last_iter: Instant::now(),
        last_outbound: Instant::now(),
    }
    .run(rx)
    .await;

    reader_task.abort();
    let _ = reader_task.await;

    observability::record_session_ended();
    match outcome {
        Outcome::Finished => tracing::info!(session = %id, "session finished"),
        Outcome::Errored(kind) => tracing::warn!(session = %id, kind, "session ended with error"),
        Outcome::TransportLost => tracing::info!(session = %id, "client went away"),
    }
}

async fn read_loop(mut reader: Box<dyn AudioReader>, tx: mpsc::Sender<ReaderEvent>) {
    let mut decoder = PcmDecoder::new();
    loop {
        match reader.next_chunk().await {
            Ok(Some(bytes)) => {
                let samples = decoder.decode(&bytes);
                if samples.is_empty() {
                    continue;
                }
                if tx.send(ReaderEvent::Audio(samples)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send(ReaderEvent::Failed(err)).await;
                break;
            }
        }
    }
}

struct Driver<'a> {
    id: Uuid,
    engine: &'a mut OnlineEngine,
    writer: &'a mut dyn RecordWriter,
    params: SessionParams,
    output: OutputState,
    pending_secs: f64,
    last_iter: Instant,
    last_outbound: Instant,
}

impl Driver<'_> {
    async fn run(mut self, mut rx: mpsc::Receiver<ReaderEvent>) -> Outcome {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ReaderEvent::Audio(samples)) => {
                        self.pending_secs += samples_to_secs(samples.len());
                        self.engine.insert_audio(&samples);
                        if self.pending_secs >= self.params.min_chunk_secs {
                            if let Some(outcome) = self.step().await {
                                return outcome;
                            }
                        }
                    }
                    Some(ReaderEvent::Failed(err)) => return self.fail(err).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    let waited = self.last_iter.elapsed().as_secs_f64();
                    if self.engine.has_audio() && waited >= self.params.max_wait_secs {
                        if let Some(outcome) = self.step().await {
                            return outcome;
                        }
                    } else if self.last_outbound.elapsed() >= PING_INTERVAL {
                        if self.writer.keepalive().await.is_err() {
                            return Outcome::TransportLost;
                        }
                        self.last_outbound = Instant::now();
                    }
                }
            }
        }

        self.finish().await
    }

    /// One engine tick. Returns `Some` when the session must end.
    async fn step(&mut self) -> Option<Outcome> {
        self.pending_secs = 0.0;
        self.last_iter = Instant::now();

        let started = Instant::now();
        match self.engine.process_iter().await {
            Ok(words) => {
                observability::record_recognizer_seconds(started.elapsed().as_secs_f64());
                if words.is_empty() {
                    return None;
                }
                observability::record_words_committed(words.len());
                if let Some(segment) = self.output.push(&words) {
                    if self.writer.send_segment(&segment).await.is_err() {
                        return Some(Outcome::TransportLost);
                    }
                    self.last_outbound = Instant::now();
                }
                None
            }
            Err(EngineError::Recognizer(err)) => {
                let err = SessionError::Recognizer(err);
                observability::record_recognizer_error();
                tracing::warn!(session = %self.id, error = %err, "recognizer unavailable");
                let _ = self.writer.send_error(err.kind()).await;
                let _ = self.writer.close().await;
                Some(Outcome::Errored(err.kind()))
            }
            Err(EngineError::Closed) => {
                tracing::error!(session = %self.id, "engine tick after finish");
                Some(Outcome::Finished)
            }
        }
    }

    /// End of input: flush the engine and close cleanly.
    async fn finish(mut self) -> Outcome {
        match self.engine.finish().await {
            Ok(words) => {
                if !words.is_empty() {
                    observability::record_words_committed(words.len());
                }
                let segment = self.output.final_segment(&words);
                if self.writer.send_final(&segment).await.is_err()
                    || self.writer.close().await.is_err()
                {
                    return Outcome::TransportLost;
                }
                Outcome::Finished
            }
            Err(EngineError::Recognizer(err)) => {
                let err = SessionError::Recognizer(err);
                observability::record_recognizer_error();
                tracing::warn!(session = %self.id, error = %err, "recognizer unavailable at finish");
                let _ = self.writer.send_error(err.kind()).await;
                let _ = self.writer.close().await;
                Outcome::Errored(err.kind())
            }
            Err(EngineError::Closed) => {
                tracing::error!(session = %self.id, "finish called twice");
                Outcome::Finished
            }
        }
    }

    async fn fail(&mut self, err: SessionError) -> Outcome {
        tracing::warn!(session = %self.id, error = %err, "reader failed");
        match err {
            // The peer is gone; no terminal record can reach it.
            SessionError::Transport(_) | SessionError::WebSocket(_) => Outcome::TransportLost,
            SessionError::Decode(_) | SessionError::Recognizer(_) => {
                let kind = err.kind();
                let _ = self.writer.send_error(kind).await;
                let _ = self.writer.close().await;
                Outcome::Errored(kind)
            }
        }
    }
}

/// Output-side bookkeeping: non-overlapping timestamps and duplicate
/// suppression.
#[derive(Debug, Default)]
struct OutputState {
    last_end_ms: u64,
    last_sent: Option<TranscriptSegment>,
}

impl OutputState {
    /// Build the record for a committed batch, or `None` when there is
    /// nothing new to send.
    fn push(&mut self, words: &[Word]) -> Option<TranscriptSegment> {
        let segment = TranscriptSegment::from_words(words, self.last_end_ms)?;
        if self.last_sent.as_ref() == Some(&segment) {
            return None;
        }
        self.last_end_ms = segment.end;
        self.last_sent = Some(segment.clone());
        Some(segment)
    }

    /// The end-of-stream record; empty text when the flush produced nothing.
    fn final_segment(&mut self, words: &[Word]) -> TranscriptSegment {
        match TranscriptSegment::from_words(words, self.last_end_ms) {
            Some(segment) => {
                self.last_end_ms = segment.end;
                segment
            }
            None => TranscriptSegment {
                start: self.last_end_ms,
                end: self.last_end_ms,
                text: String::new(),
            },
        }
    }
}
