//! Utterance orchestration: text in, PCM and stats out.

use std::{
    collections::BTreeMap,
    io::{Seek, Write},
    sync::Arc,
};

use crate::{
    backend::{load_decoder_pool, DecoderPool, Encoder, OnnxEncoder},
    cancel::CancellationToken,
    config::{EngineConfig, PhonemeType, SpeakerId, VoiceConfig},
    error::{Result, SynthesisError},
    phonemes::{
        CodepointPhonemizer, Diacritizer, EspeakPhonemizer, MissingPhonemes, PhonemeIdMapper, Phonemizer,
        Sentence,
    },
    scheduler::ParallelSynthesisScheduler,
    sentence::{SentenceSynthesizer, SynthesisParams},
    sink::AudioSink,
    stats::SynthesisResult,
    wav,
};

/// A loaded voice: config, encoder, decoder contexts, and phonemizer.
pub struct Voice {
    pub config: VoiceConfig,
    encoder: Arc<dyn Encoder>,
    decoders: Arc<DecoderPool>,
    phonemizer: Arc<dyn Phonemizer>,
    diacritizer: Option<Arc<dyn Diacritizer>>,
}

impl Voice {
    /// Load models and config named by `engine`.
    pub fn load(engine: &EngineConfig) -> Result<Self> {
        let mut config = VoiceConfig::from_path(&engine.config_path)?;
        engine.apply_overrides(&mut config);

        let encoder = OnnxEncoder::load(&engine.encoder_path, &engine.accelerator).map_err(|e| {
            SynthesisError::ResourceInit(format!(
                "failed to load encoder {}: {e:#}",
                engine.encoder_path.display()
            ))
        })?;
        let decoders = load_decoder_pool(engine)?;

        let phonemizer: Arc<dyn Phonemizer> = match config.phonemize.phoneme_type {
            PhonemeType::Text => Arc::new(CodepointPhonemizer::new(&config.phonemize)),
            PhonemeType::ESpeak => Arc::new(EspeakPhonemizer::new(&config.phonemize)),
        };

        tracing::info!(
            encoder = %engine.encoder_path.display(),
            decoder = %engine.decoder_path.display(),
            sample_rate = config.synthesis.sample_rate,
            speakers = config.model.num_speakers,
            contexts = decoders.size(),
            "voice loaded"
        );

        Ok(Self::from_parts(config, Arc::new(encoder), Arc::new(decoders), phonemizer))
    }

    pub fn from_parts(
        config: VoiceConfig,
        encoder: Arc<dyn Encoder>,
        decoders: Arc<DecoderPool>,
        phonemizer: Arc<dyn Phonemizer>,
    ) -> Self {
        Self {
            config,
            encoder,
            decoders,
            phonemizer,
            diacritizer: None,
        }
    }

    pub fn with_diacritizer(mut self, diacritizer: Arc<dyn Diacritizer>) -> Self {
        self.diacritizer = Some(diacritizer);
        self
    }
}

/// One utterance to synthesize. Unset scales fall back to the voice config.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub text: String,
    pub speaker_id: Option<SpeakerId>,
    pub noise_scale: Option<f32>,
    pub length_scale: Option<f32>,
    pub noise_w: Option<f32>,
    pub cancel: CancellationToken,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn speaker(mut self, speaker_id: SpeakerId) -> Self {
        self.speaker_id = Some(speaker_id);
        self
    }

    pub fn cancel_with(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct SynthesisDriver {
    config: VoiceConfig,
    phonemizer: Arc<dyn Phonemizer>,
    diacritizer: Option<Arc<dyn Diacritizer>>,
    ids: PhonemeIdMapper,
    scheduler: ParallelSynthesisScheduler,
}

impl SynthesisDriver {
    pub fn new(voice: Voice, worker_threads: usize) -> Result<Self> {
        let synthesizer = Arc::new(SentenceSynthesizer::new(
            voice.encoder,
            voice.decoders,
            &voice.config.phonemize,
            voice.config.synthesis.clone(),
        ));
        Ok(Self {
            scheduler: ParallelSynthesisScheduler::new(synthesizer, worker_threads)?,
            ids: PhonemeIdMapper::new(&voice.config.phonemize),
            config: voice.config,
            phonemizer: voice.phonemizer,
            diacritizer: voice.diacritizer,
        })
    }

    pub fn voice_config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.synthesis.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.config.synthesis.channels
    }

    /// Speaker name to id; empty for single-speaker voices.
    pub fn speakers(&self) -> BTreeMap<String, SpeakerId> {
        self.config.model.speaker_id_map.clone().unwrap_or_default()
    }

    fn params_for(&self, request: &SynthesisRequest) -> SynthesisParams {
        let mut params = SynthesisParams::from_config(&self.config.synthesis);
        if let Some(id) = request.speaker_id {
            params.speaker_id = Some(id);
        }
        if let Some(v) = request.noise_scale {
            params.noise_scale = v;
        }
        if let Some(v) = request.length_scale {
            params.length_scale = v;
        }
        if let Some(v) = request.noise_w {
            params.noise_w = v;
        }
        params
    }

    /// Synthesize `request`, delivering audio to `sink` as it becomes final.
    ///
    /// On failure, audio already delivered is not retracted.
    pub fn synthesize_streaming(
        &self,
        request: &SynthesisRequest,
        sink: &mut dyn AudioSink,
    ) -> Result<SynthesisResult> {
        tracing::debug!(chars = request.text.chars().count(), "phonemizing");
        let sentences = self.sentences(&request.text)?;
        if sentences.is_empty() {
            tracing::debug!("no sentences to synthesize");
            return Ok(SynthesisResult::default());
        }

        let count = sentences.len();
        let missing = self.scan_missing(&sentences);
        let params = self.params_for(request);
        tracing::debug!(sentences = count, speaker = ?params.speaker_id, "synthesizing");

        let outcome = self.scheduler.run(sentences, params, sink, &request.cancel);
        missing.log();
        match outcome {
            Ok(result) => {
                tracing::debug!(
                    sentences = count,
                    audio_seconds = result.audio_seconds,
                    infer_seconds = result.infer_seconds,
                    rtf = result.real_time_factor,
                    "synthesis done"
                );
                Ok(result)
            }
            Err(e) => {
                if e.is_cancellation() {
                    tracing::debug!("synthesis cancelled");
                } else {
                    tracing::warn!(error = %e, "synthesis failed");
                }
                Err(e)
            }
        }
    }

    /// Phonemes in `text` that the voice has no id for, with their counts.
    pub fn missing_phonemes(&self, text: &str) -> Result<MissingPhonemes> {
        Ok(self.scan_missing(&self.sentences(text)?))
    }

    fn sentences(&self, text: &str) -> Result<Vec<Sentence>> {
        let text = match &self.diacritizer {
            Some(d) => d.diacritize(text).map_err(SynthesisError::Phonemize)?,
            None => text.to_string(),
        };
        self.phonemizer.phonemize(&text).map_err(SynthesisError::Phonemize)
    }

    fn scan_missing(&self, sentences: &[Sentence]) -> MissingPhonemes {
        let mut missing = MissingPhonemes::default();
        for sentence in sentences {
            self.ids.record_missing(sentence, &mut missing);
        }
        missing
    }

    /// Synthesize into a single buffer.
    pub fn synthesize(&self, request: &SynthesisRequest) -> Result<(Vec<i16>, SynthesisResult)> {
        let mut audio: Vec<i16> = Vec::new();
        let result = self.synthesize_streaming(request, &mut audio)?;
        Ok((audio, result))
    }

    /// Synthesize into a 16-bit WAV stream.
    pub fn synthesize_to_wav<W: Write + Seek>(
        &self,
        request: &SynthesisRequest,
        writer: W,
    ) -> Result<SynthesisResult> {
        let (audio, result) = self.synthesize(request)?;
        wav::write_wav(&audio, self.sample_rate(), self.channels(), writer)?;
        Ok(result)
    }

    /// Close the decoder pool; blocked and future synthesis fails with `PoolClosed`.
    pub fn shutdown(&self) {
        tracing::info!("shutting down synthesis driver");
        self.scheduler.synthesizer().decoders().close();
    }
}
