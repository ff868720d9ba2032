use std::ops::AddAssign;

use crate::{chunked::DecodeStats, phonemes::MissingPhonemes};

/// Timing totals for an utterance, a sentence, or a phrase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisResult {
    pub infer_seconds: f64,
    pub audio_seconds: f64,
    /// `infer_seconds / audio_seconds`; below 1 is faster than real time.
    pub real_time_factor: f64,
    pub missing_phonemes: MissingPhonemes,
}

impl SynthesisResult {
    pub fn accumulate(&mut self, other: &SynthesisResult) {
        self.infer_seconds += other.infer_seconds;
        self.audio_seconds += other.audio_seconds;
        self.missing_phonemes.merge(&other.missing_phonemes);
    }

    /// Recompute the real-time factor. Left unchanged when no audio was produced.
    pub fn finalize(&mut self) {
        if self.audio_seconds > 0.0 {
            self.real_time_factor = self.infer_seconds / self.audio_seconds;
        }
    }
}

impl AddAssign<&SynthesisResult> for SynthesisResult {
    fn add_assign(&mut self, rhs: &SynthesisResult) {
        self.accumulate(rhs);
    }
}

impl AddAssign<DecodeStats> for SynthesisResult {
    fn add_assign(&mut self, rhs: DecodeStats) {
        self.infer_seconds += rhs.infer_seconds;
        self.audio_seconds += rhs.audio_seconds;
    }
}
