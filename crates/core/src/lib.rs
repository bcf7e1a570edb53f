//! Core types for the verbatim streaming transcription server
//!
//! This crate provides the foundational types shared by all other crates:
//! - Timed words and recognizer hypotheses
//! - Transcript output records
//! - PCM frame decoding

pub mod audio;
pub mod segment;
pub mod word;

pub use audio::{PcmDecoder, SAMPLE_RATE};
pub use segment::TranscriptSegment;
pub use word::{Hypothesis, Word};
