//! Common utilities for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use ndarray::Array3;
use serde_json::json;
use tts_core::{
    AcceleratorContextPool, CodepointPhonemizer, DecoderBackend, EncodeParams, Encoder,
    LatentTensors, LatentWindow, SynthesisDriver, Voice, VoiceConfig,
};

use server::{app, config::ServerConfig, AppState};

pub const SAMPLE_RATE: u32 = 16_000;
pub const SAMPLES_PER_SLICE: usize = 256;
pub const SLICES_PER_ID: usize = 2;

/// Encoder producing `SLICES_PER_ID` slices per id; fails on `x`.
pub struct StubEncoder;

impl Encoder for StubEncoder {
    fn encode(&self, ids: &[i64], params: &EncodeParams) -> anyhow::Result<LatentTensors> {
        // `x` maps to id 33 in the test voice.
        if ids.contains(&33) {
            anyhow::bail!("encoder refused input");
        }
        let n = ids.len() * SLICES_PER_ID;
        let level = 100.0 * (1 + params.speaker_id.unwrap_or(0)) as f32;
        Ok(LatentTensors::new(
            Array3::from_elem((1, 1, n), level),
            Array3::ones((1, 1, n)),
            None,
        )?)
    }
}

/// Repeats each slice's `z` value `SAMPLES_PER_SLICE` times.
pub struct StubDecoder;

impl DecoderBackend for StubDecoder {
    fn infer(&mut self, window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>> {
        let mut out = Vec::with_capacity(window.nslices() * SAMPLES_PER_SLICE);
        for t in 0..window.nslices() {
            out.extend(std::iter::repeat(window.z[[0, 0, t]] as i16).take(SAMPLES_PER_SLICE));
        }
        Ok(out)
    }
}

pub fn voice_config() -> VoiceConfig {
    let mut ids = serde_json::Map::new();
    ids.insert("_".into(), json!([0]));
    ids.insert("^".into(), json!([1]));
    ids.insert("$".into(), json!([2]));
    ids.insert(" ".into(), json!([3]));
    ids.insert(".".into(), json!([4]));
    ids.insert(",".into(), json!([5]));
    for (i, c) in ('a'..='z').enumerate() {
        ids.insert(c.to_string(), json!([10 + i as i64]));
    }
    let doc = json!({
        "audio": { "sample_rate": SAMPLE_RATE },
        "phoneme_type": "text",
        "inference": { "noise_scale": 0.667, "length_scale": 1.0, "noise_w": 0.8 },
        "phoneme_id_map": ids,
        "num_speakers": 2,
        "speaker_id_map": { "alto": 0, "bass": 1 },
    });
    let mut config = VoiceConfig::from_json(&doc.to_string()).unwrap();
    config.synthesis.sentence_silence_seconds = 0.0;
    config
}

/// Number of samples the stub engine produces for one normalised sentence.
pub fn samples_for(sentence: &str) -> usize {
    // bos pad (id pad)* eos
    let ids = 3 + 2 * sentence.chars().count();
    ids * SLICES_PER_ID * SAMPLES_PER_SLICE
}

pub fn test_driver() -> Arc<SynthesisDriver> {
    let config = voice_config();
    let phonemizer = Arc::new(CodepointPhonemizer::new(&config.phonemize));
    let pool = AcceleratorContextPool::initialize(2, |_| {
        Ok(Box::new(StubDecoder) as Box<dyn DecoderBackend>)
    })
    .unwrap();
    let voice = Voice::from_parts(config, Arc::new(StubEncoder), Arc::new(pool), phonemizer);
    Arc::new(SynthesisDriver::new(voice, 2).unwrap())
}

pub fn test_state(config: ServerConfig) -> AppState {
    AppState::new(test_driver(), config)
}

/// Create a test app instance
pub fn create_test_app() -> Router {
    create_app_with(ServerConfig::default())
}

pub fn create_app_with(config: ServerConfig) -> Router {
    app(test_state(config)).unwrap()
}
