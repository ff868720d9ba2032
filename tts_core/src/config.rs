//! Voice configuration (`*.onnx.json`) and engine settings.

use std::{collections::BTreeMap, fs, path::{Path, PathBuf}};

use serde::Deserialize;

use crate::error::{Result, SynthesisError};

pub type Phoneme = char;
pub type PhonemeId = i64;
pub type SpeakerId = i64;

const DEFAULT_SAMPLE_RATE: u32 = 22050;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhonemeType {
    ESpeak,
    Text,
}

#[derive(Debug, Clone)]
pub struct PhonemizeConfig {
    pub phoneme_type: PhonemeType,
    pub espeak_voice: String,
    pub phoneme_map: Option<BTreeMap<Phoneme, Vec<Phoneme>>>,
    pub phoneme_id_map: BTreeMap<Phoneme, Vec<PhonemeId>>,
    pub id_pad: PhonemeId,
    pub id_bos: PhonemeId,
    pub id_eos: PhonemeId,
    pub intersperse_pad: bool,
}

impl Default for PhonemizeConfig {
    fn default() -> Self {
        Self {
            phoneme_type: PhonemeType::ESpeak,
            espeak_voice: "en-us".to_string(),
            phoneme_map: None,
            phoneme_id_map: BTreeMap::new(),
            id_pad: 0,
            id_bos: 1,
            id_eos: 2,
            intersperse_pad: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_w: f32,
    pub sample_rate: u32,
    pub sample_width: u16,
    pub channels: u16,
    pub speaker_id: Option<SpeakerId>,
    pub sentence_silence_seconds: f32,
    pub phoneme_silence_seconds: Option<BTreeMap<Phoneme, f32>>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            noise_scale: 0.667,
            length_scale: 1.0,
            noise_w: 0.8,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_width: 2,
            channels: 1,
            speaker_id: None,
            sentence_silence_seconds: 0.2,
            phoneme_silence_seconds: None,
        }
    }
}

impl SynthesisConfig {
    /// Number of interleaved samples covering `seconds` of audio.
    pub fn samples_for(&self, seconds: f32) -> usize {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f32 * self.channels as f32) as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub num_speakers: usize,
    pub speaker_id_map: Option<BTreeMap<String, SpeakerId>>,
}

/// Everything the engine reads from a voice's JSON config.
#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    pub phonemize: PhonemizeConfig,
    pub synthesis: SynthesisConfig,
    pub model: ModelConfig,
}

// Raw document shape; keys stay strings until validated as single codepoints.
#[derive(Deserialize)]
struct RawVoiceConfig {
    #[serde(default)]
    audio: Option<RawAudio>,
    #[serde(default)]
    inference: Option<RawInference>,
    #[serde(default)]
    espeak: Option<RawESpeak>,
    #[serde(default)]
    phoneme_type: Option<String>,
    #[serde(default)]
    phoneme_map: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    phoneme_id_map: Option<BTreeMap<String, Vec<PhonemeId>>>,
    #[serde(default)]
    num_speakers: Option<usize>,
    #[serde(default)]
    speaker_id_map: Option<BTreeMap<String, SpeakerId>>,
}

#[derive(Deserialize)]
struct RawAudio {
    sample_rate: Option<u32>,
}

#[derive(Deserialize)]
struct RawInference {
    noise_scale: Option<f32>,
    length_scale: Option<f32>,
    noise_w: Option<f32>,
    phoneme_silence: Option<BTreeMap<String, f32>>,
}

#[derive(Deserialize)]
struct RawESpeak {
    voice: Option<String>,
}

fn single_codepoint(s: &str, table: &str) -> Result<Phoneme> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => {
            tracing::error!(phoneme = %s, table, "phoneme is not a single codepoint");
            Err(SynthesisError::Configuration(format!(
                "phonemes must be one codepoint ({table}): {s:?}"
            )))
        }
    }
}

impl VoiceConfig {
    /// Load and validate a voice config file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "parsing voice config");
        let text = fs::read_to_string(path).map_err(|e| {
            SynthesisError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawVoiceConfig = serde_json::from_str(text)
            .map_err(|e| SynthesisError::Configuration(format!("voice config is not valid JSON: {e}")))?;

        let mut config = VoiceConfig::default();

        if let Some(voice) = raw.espeak.and_then(|e| e.voice) {
            config.phonemize.espeak_voice = voice;
        }
        if raw.phoneme_type.as_deref() == Some("text") {
            config.phonemize.phoneme_type = PhonemeType::Text;
        }

        if let Some(id_map) = raw.phoneme_id_map {
            for (from, ids) in id_map {
                let phoneme = single_codepoint(&from, "phoneme id map")?;
                config.phonemize.phoneme_id_map.entry(phoneme).or_default().extend(ids);
            }
        }
        let ids = &config.phonemize.phoneme_id_map;
        if let Some(&pad) = ids.get(&'_').and_then(|v| v.first()) {
            config.phonemize.id_pad = pad;
        }
        if let Some(&bos) = ids.get(&'^').and_then(|v| v.first()) {
            config.phonemize.id_bos = bos;
        }
        if let Some(&eos) = ids.get(&'$').and_then(|v| v.first()) {
            config.phonemize.id_eos = eos;
        }

        if let Some(map) = raw.phoneme_map {
            let mut out = BTreeMap::new();
            for (from, to) in map {
                let from = single_codepoint(&from, "phoneme map")?;
                let to = to
                    .iter()
                    .map(|p| single_codepoint(p, "phoneme map"))
                    .collect::<Result<Vec<_>>>()?;
                out.insert(from, to);
            }
            config.phonemize.phoneme_map = Some(out);
        }

        if let Some(rate) = raw.audio.and_then(|a| a.sample_rate) {
            if rate == 0 {
                return Err(SynthesisError::Configuration("audio.sample_rate must be positive".into()));
            }
            config.synthesis.sample_rate = rate;
        }

        if let Some(inference) = raw.inference {
            if let Some(v) = inference.noise_scale {
                config.synthesis.noise_scale = v;
            }
            if let Some(v) = inference.length_scale {
                config.synthesis.length_scale = v;
            }
            if let Some(v) = inference.noise_w {
                config.synthesis.noise_w = v;
            }
            if let Some(silence) = inference.phoneme_silence {
                let mut out = BTreeMap::new();
                for (phoneme, seconds) in silence {
                    let phoneme = single_codepoint(&phoneme, "phoneme silence")?;
                    if !seconds.is_finite() || seconds < 0.0 {
                        return Err(SynthesisError::Configuration(format!(
                            "phoneme silence for {phoneme:?} must be a non-negative number of seconds"
                        )));
                    }
                    out.insert(phoneme, seconds);
                }
                config.synthesis.phoneme_silence_seconds = Some(out);
            }
        }

        config.model.num_speakers = raw.num_speakers.unwrap_or(1);
        config.model.speaker_id_map = raw.speaker_id_map;
        if config.model.num_speakers > 1 {
            // Multi-speaker voices default to the first speaker.
            config.synthesis.speaker_id = Some(0);
        }

        Ok(config)
    }

    /// Resolve a speaker name through `speaker_id_map`.
    pub fn speaker_by_name(&self, name: &str) -> Option<SpeakerId> {
        self.model.speaker_id_map.as_ref()?.get(name).copied()
    }
}

/// Load-time settings for a [`crate::Voice`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub config_path: PathBuf,
    /// `""`/`"cpu"` or `"cuda"`; ignored by backends that are not ONNX.
    pub accelerator: String,
    /// Number of duplicated decoder contexts (e.g. 3 NPU cores).
    pub decoder_contexts: usize,
    /// Fixed temporal size of the decoder graph, for fixed-shape exports.
    pub decoder_fixed_window: Option<usize>,
    /// Width of the sentence worker pool.
    pub worker_threads: usize,
    pub speaker_id: Option<SpeakerId>,
    pub noise_scale: Option<f32>,
    pub length_scale: Option<f32>,
    pub noise_w: Option<f32>,
    pub sentence_silence_seconds: Option<f32>,
    pub phoneme_silence_seconds: Option<BTreeMap<Phoneme, f32>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            encoder_path: PathBuf::from("models/encoder.onnx"),
            decoder_path: PathBuf::from("models/decoder.onnx"),
            config_path: PathBuf::from("models/model.onnx.json"),
            accelerator: String::new(),
            decoder_contexts: 1,
            decoder_fixed_window: None,
            worker_threads: 3,
            speaker_id: None,
            noise_scale: None,
            length_scale: None,
            noise_w: None,
            sentence_silence_seconds: None,
            phoneme_silence_seconds: None,
        }
    }
}

impl EngineConfig {
    /// Apply command-line / environment overrides on top of a parsed voice config.
    pub fn apply_overrides(&self, voice: &mut VoiceConfig) {
        let synthesis = &mut voice.synthesis;
        if let Some(v) = self.noise_scale {
            synthesis.noise_scale = v;
        }
        if let Some(v) = self.length_scale {
            synthesis.length_scale = v;
        }
        if let Some(v) = self.noise_w {
            synthesis.noise_w = v;
        }
        if let Some(v) = self.sentence_silence_seconds {
            synthesis.sentence_silence_seconds = v;
        }
        if let Some(map) = &self.phoneme_silence_seconds {
            synthesis
                .phoneme_silence_seconds
                .get_or_insert_with(BTreeMap::new)
                .extend(map.iter().map(|(k, v)| (*k, *v)));
        }
        if voice.model.num_speakers > 1 {
            if let Some(id) = self.speaker_id {
                synthesis.speaker_id = Some(id);
            }
        }
    }
}
