//! Recognizer adapters, VAD gate, and the online reconciliation engine.
//!
//! This crate turns an offline speech recognizer into a streaming,
//! committed-prefix transcript producer:
//! - `asr`: the recognizer abstraction and its backend variants
//! - `vad`: speech/silence classification used to pick safe trim points
//! - `engine`: the sliding audio buffer and LocalAgreement-2 reconciliation

pub mod asr;
pub mod engine;
pub mod vad;

pub use asr::{create_transcriber, AsrError, Capabilities, Transcriber};
pub use engine::{EngineError, OnlineEngine};
pub use vad::{EnergyGate, SpeechGate, VadError, VadInterval, VadKind};
