//! Overlap-chunked decoding with seam search.
//!
//! Long latent sequences are decoded in windows of [`CHUNK_SIZE`] slices with
//! [`PADDING`] slices of context on each side. The padding samples are cut
//! away again, and each seam is moved to the nearby offset where the new
//! chunk best matches the tail already produced, then the overlap is
//! averaged.

use std::time::Instant;

use crate::{
    backend::DecoderBackend,
    cancel::CancellationToken,
    error::{Result, SynthesisError},
    pool::AcceleratorContextPool,
    sink::PcmWriter,
    tensors::{LatentTensors, LatentWindow},
};

pub const CHUNK_SIZE: usize = 45;
pub const PADDING: usize = 5;
pub const SAMPLES_PER_SLICE: usize = 256;
pub const COMPARE_WINDOW: usize = 24;
pub const SEARCH_WINDOW: usize = 44;
pub const SEARCH_STEP: usize = 4;

/// Timing and size accounting for one decode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeStats {
    pub audio_seconds: f64,
    pub infer_seconds: f64,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    pub chunk_size: usize,
    pub padding: usize,
    pub samples_per_slice: usize,
    pub compare_window: usize,
    pub search_window: usize,
    pub search_step: usize,
    pub sample_rate: u32,
}

impl ChunkedDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            padding: PADDING,
            samples_per_slice: SAMPLES_PER_SLICE,
            compare_window: COMPARE_WINDOW,
            search_window: SEARCH_WINDOW,
            search_step: SEARCH_STEP,
            sample_rate,
        }
    }

    /// Shortest sequence that is split into chunks.
    pub fn chunk_threshold(&self) -> usize {
        self.chunk_size + 2 * self.padding
    }

    /// Decode `latents` into `out`, leasing a context from `pool` per call.
    pub fn decode<C>(
        &self,
        pool: &AcceleratorContextPool<C>,
        latents: &LatentTensors,
        out: &mut PcmWriter<'_>,
        cancel: &CancellationToken,
    ) -> Result<DecodeStats>
    where
        C: DecoderBackend,
    {
        let nslices = latents.nslices()?;
        let mut stats = DecodeStats::default();
        if nslices == 0 {
            return Ok(stats);
        }

        if nslices < self.chunk_threshold() {
            cancel.check()?;
            let (audio, infer_seconds) = decode_window(pool, latents.full())?;
            out.extend(&audio);
            stats.audio_seconds = audio.len() as f64 / self.sample_rate as f64;
            stats.infer_seconds = infer_seconds;
            stats.chunks = 1;
            return Ok(stats);
        }

        let cw = self.compare_window;
        let mut produced = 0usize;
        let mut i = 0usize;
        while i < nslices {
            cancel.check()?;
            let start = i.saturating_sub(self.padding);
            let end = nslices.min(i + self.chunk_size + self.padding);
            let (audio, infer_seconds) = decode_window(pool, latents.window(start, end))?;

            let end_pad = if i + self.chunk_size >= nslices {
                0
            } else if i + self.chunk_size + self.padding >= nslices {
                nslices - (i + self.chunk_size)
            } else {
                self.padding
            };
            let usable_end = audio.len().saturating_sub(end_pad * self.samples_per_slice);
            let mut usable_start = ((i - start) * self.samples_per_slice).min(usable_end);

            if produced >= cw && audio.len() >= 2 * self.search_window {
                if let Some(tail) = out.tail_mut(cw) {
                    if let Some(join) = self.best_join(tail, &audio, usable_start, usable_end) {
                        usable_start = join;
                        for (prev, next) in tail.iter_mut().zip(&audio[join - cw..join]) {
                            *prev = ((*prev as i32 + *next as i32) / 2) as i16;
                        }
                    }
                }
            }

            let usable = &audio[usable_start..usable_end];
            out.extend(usable);
            produced += usable.len();
            if out.is_streaming() && out.pending() > cw {
                out.flush_keep(cw);
            }

            let chunk_audio_seconds = usable.len() as f64 / self.sample_rate as f64;
            stats.audio_seconds += chunk_audio_seconds;
            stats.infer_seconds += infer_seconds;
            tracing::debug!(
                chunk = stats.chunks,
                seconds = infer_seconds,
                rtf = infer_seconds / chunk_audio_seconds.max(f64::EPSILON),
                "decoded chunk"
            );
            stats.chunks += 1;
            i += self.chunk_size;
        }
        Ok(stats)
    }

    /// Pick the seam offset in `audio` whose preceding `compare_window`
    /// samples best match `tail` (least sum of absolute differences).
    ///
    /// Candidates lie within `±search_window` of `naive`, stepping by
    /// `search_step`; ties go to the candidate nearest `naive`.
    fn best_join(&self, tail: &[i16], audio: &[i16], naive: usize, limit: usize) -> Option<usize> {
        let cw = self.compare_window;
        let step = self.search_step.max(1) as isize;
        let reach = self.search_window as isize / step;

        // 0, -step, +step, -2*step, ... so strict `<` keeps the nearest on ties.
        let offsets = std::iter::once(0).chain((1..=reach).flat_map(|k| [-k * step, k * step]));

        let mut best: Option<(u64, usize)> = None;
        for d in offsets {
            let candidate = naive as isize + d;
            if candidate < cw as isize || candidate as usize > limit {
                continue;
            }
            let candidate = candidate as usize;
            let score: u64 = tail
                .iter()
                .zip(&audio[candidate - cw..candidate])
                .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs() as u64)
                .sum();
            if best.map_or(true, |(s, _)| score < s) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, candidate)| candidate)
    }
}

fn decode_window<C: DecoderBackend>(
    pool: &AcceleratorContextPool<C>,
    window: LatentWindow<'_>,
) -> Result<(Vec<i16>, f64)> {
    let mut lease = pool.acquire()?;
    let t0 = Instant::now();
    // Backends raise engine errors such as `DataInvariant` directly; keep those as is.
    let audio = lease.infer(window).map_err(|e| match e.downcast::<SynthesisError>() {
        Ok(inner) => inner,
        Err(e) => SynthesisError::decoder(e),
    })?;
    let seconds = t0.elapsed().as_secs_f64();
    drop(lease);
    Ok((audio, seconds))
}
