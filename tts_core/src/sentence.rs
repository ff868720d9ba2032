//! Single-sentence synthesis: phrases, encoding, chunked decoding, silence.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::{
    backend::{DecoderPool, EncodeParams, Encoder},
    cancel::CancellationToken,
    chunked::ChunkedDecoder,
    config::{Phoneme, PhonemizeConfig, SpeakerId, SynthesisConfig},
    error::{Result, SynthesisError},
    phonemes::PhonemeIdMapper,
    sink::PcmWriter,
    stats::SynthesisResult,
};

/// A run of phonemes followed by `silence_samples` of silence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phrase {
    pub phonemes: Vec<Phoneme>,
    pub silence_samples: usize,
}

/// Split `sentence` after every phoneme that has a configured silence.
///
/// The final phrase is always emitted, even when empty.
pub fn segment_phrases(
    sentence: &[Phoneme],
    phoneme_silence: Option<&BTreeMap<Phoneme, f32>>,
    config: &SynthesisConfig,
) -> Vec<Phrase> {
    let Some(silence) = phoneme_silence else {
        return vec![Phrase {
            phonemes: sentence.to_vec(),
            silence_samples: 0,
        }];
    };

    let mut phrases = Vec::new();
    let mut current = Vec::new();
    for &phoneme in sentence {
        current.push(phoneme);
        if let Some(&seconds) = silence.get(&phoneme) {
            phrases.push(Phrase {
                phonemes: std::mem::take(&mut current),
                silence_samples: config.samples_for(seconds),
            });
        }
    }
    phrases.push(Phrase {
        phonemes: current,
        silence_samples: 0,
    });
    phrases
}

/// Per-request inference settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    pub speaker_id: Option<SpeakerId>,
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_w: f32,
}

impl SynthesisParams {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            speaker_id: config.speaker_id,
            noise_scale: config.noise_scale,
            length_scale: config.length_scale,
            noise_w: config.noise_w,
        }
    }

    fn encode_params(&self) -> EncodeParams {
        EncodeParams {
            noise_scale: self.noise_scale,
            length_scale: self.length_scale,
            noise_w: self.noise_w,
            speaker_id: self.speaker_id,
        }
    }
}

/// Synthesizes one sentence at a time; shared by every worker thread.
pub struct SentenceSynthesizer {
    encoder: Arc<dyn Encoder>,
    decoders: Arc<DecoderPool>,
    ids: PhonemeIdMapper,
    chunked: ChunkedDecoder,
    config: SynthesisConfig,
}

impl SentenceSynthesizer {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        decoders: Arc<DecoderPool>,
        phonemize: &PhonemizeConfig,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            encoder,
            decoders,
            ids: PhonemeIdMapper::new(phonemize),
            chunked: ChunkedDecoder::new(config.sample_rate * config.channels as u32),
            config,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn decoders(&self) -> &DecoderPool {
        &self.decoders
    }

    /// Synthesize `sentence` into `out`, flushing after every phrase and
    /// once more after the sentence silence.
    ///
    /// Audio seconds count decoded audio only, not inserted silence.
    pub fn synthesize(
        &self,
        sentence: &[Phoneme],
        params: &SynthesisParams,
        out: &mut PcmWriter<'_>,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult> {
        let started = Instant::now();
        let phrases = segment_phrases(sentence, self.config.phoneme_silence_seconds.as_ref(), &self.config);
        let encode_params = params.encode_params();
        let mut result = SynthesisResult::default();
        let mut first_audio_logged = false;

        for (index, phrase) in phrases.iter().enumerate() {
            if !phrase.phonemes.is_empty() {
                cancel.check()?;
                let ids = self.ids.ids_for(&phrase.phonemes, &mut result.missing_phonemes);

                let t0 = Instant::now();
                let latents = self
                    .encoder
                    .encode(&ids, &encode_params)
                    .map_err(SynthesisError::encoder)?;
                let encode_seconds = t0.elapsed().as_secs_f64();
                tracing::debug!(phrase = index, ids = ids.len(), seconds = encode_seconds, "encoded phrase");
                result.infer_seconds += encode_seconds;

                result += self.chunked.decode(&self.decoders, &latents, out, cancel)?;
            }

            if phrase.silence_samples > 0 {
                out.push_silence(phrase.silence_samples);
            }
            out.flush();

            if !first_audio_logged && out.total() > 0 {
                first_audio_logged = true;
                tracing::debug!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "first audio of sentence ready"
                );
            }
        }

        let sentence_silence = self.config.samples_for(self.config.sentence_silence_seconds);
        if sentence_silence > 0 {
            out.push_silence(sentence_silence);
            out.flush();
        }

        result.finalize();
        Ok(result)
    }
}
