//! Working state between recognizer calls.

use verbatim_core::Word;

/// How far apart two word starts may be and still refer to the same token.
const MATCH_WINDOW_SECS: f64 = 0.5;

/// A new hypothesis starting this close to the committed tail is checked for
/// an n-gram duplicated from it.
const TAIL_DEDUP_WINDOW_SECS: f64 = 1.0;

/// Longest duplicated n-gram dropped at the committed boundary.
const TAIL_DEDUP_MAX_NGRAM: usize = 5;

/// Holds the unconfirmed words between recognizer calls.
///
/// `insert` maps the latest hypothesis into absolute time and filters out
/// what is already committed; `agree` runs the LocalAgreement-2 step against
/// the previous call's unconfirmed tail and returns the newly confirmed
/// prefix.
#[derive(Debug, Default)]
pub struct HypothesisBuffer {
    /// Unconfirmed tail of the previous hypothesis.
    buffer: Vec<Word>,
    /// Words from the latest hypothesis, not yet reconciled.
    new: Vec<Word>,
    /// End of the last committed word.
    last_committed_time: f64,
}

impl HypothesisBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb the latest hypothesis.
    ///
    /// `offset` is the audio buffer's time offset; `committed_tail` is the
    /// recent committed suffix used to drop words the recognizer re-emitted
    /// across the trim boundary.
    pub fn insert(&mut self, hypothesis: Vec<Word>, offset: f64, committed_tail: &[Word]) {
        let mut incoming: Vec<Word> = hypothesis
            .iter()
            .map(|w| w.shifted(offset))
            .filter(|w| w.end > self.last_committed_time)
            .collect();

        if let Some(first) = incoming.first() {
            if (first.start - self.last_committed_time).abs() < TAIL_DEDUP_WINDOW_SECS {
                if let Some(n) = duplicated_ngram(committed_tail, &incoming) {
                    tracing::debug!(n, "dropping n-gram duplicated from the committed tail");
                    incoming.drain(..n);
                }
            }
        }

        // A re-decoded committed word can straddle the boundary: its end
        // creeps past the committed end while its start stays put. It is the
        // same occurrence, not new content.
        while let Some(first) = incoming.first() {
            if committed_tail.iter().any(|c| words_match(first, c)) {
                tracing::debug!(word = %first.text, "dropping word straddling the committed boundary");
                incoming.remove(0);
            } else {
                break;
            }
        }

        self.new = incoming;
    }

    /// LocalAgreement-2: commit the longest prefix on which the latest
    /// hypothesis and the previous unconfirmed tail agree.
    ///
    /// The committed words come from the *newer* hypothesis, so casing and
    /// punctuation follow the most recent decode. The unmatched remainder of
    /// the new hypothesis becomes the tail for the next call.
    pub fn agree(&mut self) -> Vec<Word> {
        let mut matched = 0;
        for (new_word, prev_word) in self.new.iter().zip(self.buffer.iter()) {
            if words_match(new_word, prev_word) {
                matched += 1;
            } else {
                break;
            }
        }

        let committed: Vec<Word> = self.new.drain(..matched).collect();
        if let Some(last) = committed.last() {
            self.last_committed_time = last.end;
        }

        self.buffer = std::mem::take(&mut self.new);
        committed
    }

    /// The words still awaiting a second opinion.
    pub fn pending(&self) -> &[Word] {
        &self.buffer
    }

    /// Flush everything unconfirmed; only valid at end of stream where no
    /// second opinion can ever arrive.
    pub fn take_pending(&mut self) -> Vec<Word> {
        let words = std::mem::take(&mut self.buffer);
        if let Some(last) = words.last() {
            self.last_committed_time = last.end;
        }
        words
    }

    /// Drop pending words wholly before the trim point `t`.
    pub fn drop_before(&mut self, t: f64) {
        self.buffer.retain(|w| w.end > t);
    }

    pub fn last_committed_time(&self) -> f64 {
        self.last_committed_time
    }
}

fn words_match(a: &Word, b: &Word) -> bool {
    if (a.start - b.start).abs() > MATCH_WINDOW_SECS {
        return false;
    }

    let na = a.normalized();
    let nb = b.normalized();
    if na.is_empty() && nb.is_empty() {
        // Both pure punctuation: compare the raw tokens.
        return a.text.trim() == b.text.trim();
    }
    na == nb
}

/// Longest n-gram (up to [`TAIL_DEDUP_MAX_NGRAM`]) that ends the committed
/// tail and starts the incoming hypothesis.
fn duplicated_ngram(committed_tail: &[Word], incoming: &[Word]) -> Option<usize> {
    let max_n = committed_tail
        .len()
        .min(incoming.len())
        .min(TAIL_DEDUP_MAX_NGRAM);

    (1..=max_n).rev().find(|&n| {
        committed_tail[committed_tail.len() - n..]
            .iter()
            .map(Word::normalized)
            .eq(incoming[..n].iter().map(Word::normalized))
    })
}
