//! Transcript output records.

use serde::{Deserialize, Serialize};

use crate::word::{join_words, Word};

/// One committed word batch as it goes on the wire.
///
/// Timestamps are absolute session time in milliseconds. On raw TCP a segment
/// is rendered as `"<start_ms> <end_ms> <text>\n"`; on WebSocket it is the
/// JSON message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: u64,
    pub end: u64,
    pub text: String,
}

impl TranscriptSegment {
    /// Build a segment from a non-empty committed word batch.
    ///
    /// `floor_ms` is the end of the previously emitted segment; the start is
    /// clamped to it so successive records never overlap (the difference is
    /// normally a few tens of milliseconds of recognizer jitter).
    pub fn from_words(words: &[Word], floor_ms: u64) -> Option<Self> {
        let first = words.first()?;
        let last = words.last()?;

        let start = secs_to_ms(first.start).max(floor_ms);
        let end = secs_to_ms(last.end).max(start);

        Some(Self {
            start,
            end,
            text: join_words(words),
        })
    }

    /// Render as a raw TCP record line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.start, self.end, self.text)
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}
