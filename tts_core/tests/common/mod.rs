//! Synthetic backends for driving the engine without model files.
#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use ndarray::Array3;
use serde_json::json;
use tts_core::{
    AcceleratorContextPool, CodepointPhonemizer, DecoderBackend, DecoderPool, EncodeParams, Encoder,
    LatentTensors, LatentWindow, SynthesisDriver, Voice, VoiceConfig,
};

pub const SAMPLE_RATE: u32 = 10_000;
pub const SAMPLES_PER_SLICE: usize = 256;

/// Id of letter `c` in the test voice.
pub fn letter_id(c: char) -> i64 {
    10 + (c as i64 - 'a' as i64)
}

/// Text voice: `a`..`z` map to 10..35, `.` to 50, `,` to 51.
pub fn voice_config(sentence_silence: f32, phoneme_silence: Option<BTreeMap<&str, f32>>) -> VoiceConfig {
    let mut ids = serde_json::Map::new();
    ids.insert("_".into(), json!([0]));
    ids.insert("^".into(), json!([1]));
    ids.insert("$".into(), json!([2]));
    ids.insert(".".into(), json!([50]));
    ids.insert(",".into(), json!([51]));
    for c in 'a'..='z' {
        ids.insert(c.to_string(), json!([letter_id(c)]));
    }
    let mut inference = json!({});
    if let Some(silence) = phoneme_silence {
        inference["phoneme_silence"] = json!(silence);
    }
    let doc = json!({
        "audio": { "sample_rate": SAMPLE_RATE },
        "phoneme_type": "text",
        "inference": inference,
        "phoneme_id_map": ids,
        "num_speakers": 2,
        "speaker_id_map": { "low": 0, "high": 1 },
    });
    let mut config = VoiceConfig::from_json(&doc.to_string()).unwrap();
    config.synthesis.sentence_silence_seconds = sentence_silence;
    config
}

/// Encoder that tags its latents with the first letter id of the phrase.
///
/// Each id becomes `slices_per_id` slices whose `z` value is the tag, so the
/// decoded audio of a phrase is a constant run of the tag value.
#[derive(Default)]
pub struct TagEncoder {
    pub slices_per_id: usize,
    pub delay_ms: BTreeMap<i64, u64>,
    pub fail_tag: Option<i64>,
    pub panic_tag: Option<i64>,
    pub encoded: Mutex<Vec<i64>>,
    pub speakers: Mutex<Vec<Option<i64>>>,
}

impl TagEncoder {
    pub fn new(slices_per_id: usize) -> Self {
        Self {
            slices_per_id,
            ..Default::default()
        }
    }

    pub fn encoded(&self) -> Vec<i64> {
        let mut tags = self.encoded.lock().unwrap().clone();
        tags.sort();
        tags
    }
}

impl Encoder for TagEncoder {
    fn encode(&self, ids: &[i64], params: &EncodeParams) -> anyhow::Result<LatentTensors> {
        let tag = ids.iter().copied().find(|id| (10..50).contains(id)).unwrap_or(50);
        if let Some(ms) = self.delay_ms.get(&tag) {
            std::thread::sleep(Duration::from_millis(*ms));
        }
        if self.fail_tag == Some(tag) {
            anyhow::bail!("encoder rejected tag {tag}");
        }
        if self.panic_tag == Some(tag) {
            panic!("encoder crashed on tag {tag}");
        }
        self.encoded.lock().unwrap().push(tag);
        self.speakers.lock().unwrap().push(params.speaker_id);

        let n = ids.len() * self.slices_per_id;
        Ok(LatentTensors::new(
            Array3::from_elem((1, 1, n), tag as f32),
            Array3::ones((1, 1, n)),
            None,
        )?)
    }
}

/// Emits `SAMPLES_PER_SLICE` samples per slice, each equal to the slice's `z`.
pub struct EchoDecoder;

impl DecoderBackend for EchoDecoder {
    fn infer(&mut self, window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>> {
        let mut out = Vec::with_capacity(window.nslices() * SAMPLES_PER_SLICE);
        for t in 0..window.nslices() {
            let v = window.z[[0, 0, t]] as i16;
            out.extend(std::iter::repeat(v).take(SAMPLES_PER_SLICE));
        }
        Ok(out)
    }
}

pub fn echo_pool(contexts: usize) -> Arc<DecoderPool> {
    Arc::new(
        AcceleratorContextPool::initialize(contexts, |_| Ok(Box::new(EchoDecoder) as Box<dyn DecoderBackend>))
            .unwrap(),
    )
}

pub fn driver_with(
    config: VoiceConfig,
    encoder: Arc<TagEncoder>,
    contexts: usize,
    threads: usize,
) -> SynthesisDriver {
    let phonemizer = Arc::new(CodepointPhonemizer::new(&config.phonemize));
    let voice = Voice::from_parts(config, encoder, echo_pool(contexts), phonemizer);
    SynthesisDriver::new(voice, threads).unwrap()
}

/// Collapse audio into the sequence of non-silent values it plays.
pub fn runs(samples: &[i16]) -> Vec<i16> {
    let mut out: Vec<i16> = Vec::new();
    for &s in samples.iter().filter(|&&s| s != 0) {
        if out.last() != Some(&s) {
            out.push(s);
        }
    }
    out
}
