//! Streaming output: sinks and the per-sentence PCM buffer.

/// Receives newly finalized PCM samples.
///
/// The slice is only valid for the duration of the call; implementations
/// must copy what they need before returning.
pub trait AudioSink {
    fn accept(&mut self, samples: &[i16]);
}

impl<F> AudioSink for F
where
    F: FnMut(&[i16]),
{
    fn accept(&mut self, samples: &[i16]) {
        self(samples)
    }
}

impl AudioSink for Vec<i16> {
    fn accept(&mut self, samples: &[i16]) {
        self.extend_from_slice(samples);
    }
}

/// Sink that keeps every flush so it can be replayed later, in order.
///
/// Used for sentences synthesized on a worker thread: the caller's sink is
/// not shared across threads, so each worker records its flushes and the
/// joining thread replays them once all earlier sentences are out.
#[derive(Debug, Default)]
pub struct RecordingSink {
    samples: Vec<i16>,
    // End offset of each flush within `samples`.
    boundaries: Vec<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn flushes(&self) -> usize {
        self.boundaries.len()
    }

    /// Re-deliver the recorded flushes to `sink`, one call per original flush.
    pub fn replay(&self, sink: &mut dyn AudioSink) {
        let mut start = 0;
        for &end in &self.boundaries {
            sink.accept(&self.samples[start..end]);
            start = end;
        }
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

impl AudioSink for RecordingSink {
    fn accept(&mut self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        self.samples.extend_from_slice(samples);
        self.boundaries.push(self.samples.len());
    }
}

/// Running PCM buffer for one sentence, optionally draining into a sink.
///
/// Without a sink the buffer simply accumulates. With a sink, flushing hands
/// samples over and clears them; [`PcmWriter::flush_keep`] holds back a tail
/// that a later chunk boundary may still rewrite.
pub struct PcmWriter<'a> {
    buffer: Vec<i16>,
    sink: Option<&'a mut dyn AudioSink>,
    flushed: usize,
}

impl<'a> PcmWriter<'a> {
    pub fn buffered() -> Self {
        Self {
            buffer: Vec::new(),
            sink: None,
            flushed: 0,
        }
    }

    pub fn streaming(sink: &'a mut dyn AudioSink) -> Self {
        Self {
            buffer: Vec::new(),
            sink: Some(sink),
            flushed: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    /// Samples held in the buffer (not yet handed to a sink).
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Total samples written so far, flushed or not.
    pub fn total(&self) -> usize {
        self.flushed + self.buffer.len()
    }

    pub fn extend(&mut self, samples: &[i16]) {
        self.buffer.extend_from_slice(samples);
    }

    pub fn push_silence(&mut self, samples: usize) {
        self.buffer.resize(self.buffer.len() + samples, 0);
    }

    /// The last `n` unflushed samples, or `None` if fewer are buffered.
    pub fn tail_mut(&mut self, n: usize) -> Option<&mut [i16]> {
        let len = self.buffer.len();
        if n > len {
            return None;
        }
        Some(&mut self.buffer[len - n..])
    }

    /// Flush everything except the trailing `keep` samples. No-op without a sink.
    pub fn flush_keep(&mut self, keep: usize) {
        let Some(sink) = self.sink.as_deref_mut() else {
            return;
        };
        if self.buffer.len() <= keep {
            return;
        }
        let cut = self.buffer.len() - keep;
        sink.accept(&self.buffer[..cut]);
        self.buffer.drain(..cut);
        self.flushed += cut;
    }

    /// Flush the whole buffer. No-op without a sink or with nothing pending.
    pub fn flush(&mut self) {
        let Some(sink) = self.sink.as_deref_mut() else {
            return;
        };
        if self.buffer.is_empty() {
            return;
        }
        sink.accept(&self.buffer);
        self.flushed += self.buffer.len();
        self.buffer.clear();
    }

    /// Remaining buffered samples (everything, when no sink was attached).
    pub fn into_samples(self) -> Vec<i16> {
        self.buffer
    }
}
