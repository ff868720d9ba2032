use std::str::FromStr;

use serde::Deserialize;
use tts_core::{SynthesisRequest, VoiceConfig};

use crate::error::ApiError;

/// Maximum text length for synthesis requests, in characters
const MAX_TEXT_LENGTH: usize = 5000;
/// Minimum text length for synthesis requests, in characters
const MIN_TEXT_LENGTH: usize = 1;

/// Body of `POST /api/v1/synthesise` and of each stream message.
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisApiParams {
    pub text: String,
    pub speaker_id: Option<i64>,
    pub speaker: Option<String>,
    pub length_scale: Option<f32>,
    pub noise_scale: Option<f32>,
    pub noise_w: Option<f32>,
    pub audio_format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Wav,
    /// Raw little-endian 16-bit PCM.
    Pcm,
    /// JSON with a base64 WAV payload.
    Json,
}

impl FromStr for AudioFormat {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "pcm" | "raw" => Ok(AudioFormat::Pcm),
            "json" | "base64" => Ok(AudioFormat::Json),
            other => Err(ApiError::InvalidInput(format!(
                "Unsupported audio_format: {other}. Expected wav, pcm or json"
            ))),
        }
    }
}

/// Validate request text length.
pub fn validate_text(text: &str) -> Result<(), ApiError> {
    let len = text.trim().chars().count();
    if len < MIN_TEXT_LENGTH {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if len > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

fn validate_scale(name: &str, value: Option<f32>) -> Result<(), ApiError> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(ApiError::InvalidInput(format!(
            "{name} must be a positive number"
        ))),
        _ => Ok(()),
    }
}

/// Check `params` against the loaded voice and turn it into an engine request.
pub fn validate_synthesis_request(
    params: SynthesisApiParams,
    voice: &VoiceConfig,
) -> Result<(SynthesisRequest, AudioFormat), ApiError> {
    validate_text(&params.text)?;
    validate_scale("length_scale", params.length_scale)?;
    validate_scale("noise_scale", params.noise_scale)?;
    validate_scale("noise_w", params.noise_w)?;

    let mut speaker_id = params.speaker_id;
    if let Some(name) = params.speaker.as_deref() {
        if voice.model.speaker_id_map.is_none() {
            return Err(ApiError::InvalidInput(
                "Speaker ID map is not available".to_string(),
            ));
        }
        speaker_id = Some(voice.speaker_by_name(name).ok_or_else(|| {
            ApiError::InvalidInput(format!("Unknown speaker name {name}"))
        })?);
    }
    if let Some(id) = speaker_id {
        if id < 0 || id as usize >= voice.model.num_speakers {
            return Err(ApiError::InvalidInput(format!(
                "Speaker ID {id} is out of range (voice has {} speaker(s))",
                voice.model.num_speakers
            )));
        }
    }

    let format = match params.audio_format.as_deref() {
        Some(f) => f.parse()?,
        None => AudioFormat::default(),
    };

    let request = SynthesisRequest {
        text: normalize_text(&params.text),
        speaker_id,
        noise_scale: params.noise_scale,
        length_scale: params.length_scale,
        noise_w: params.noise_w,
        ..Default::default()
    };
    Ok((request, format))
}

/// Parse a stream message: a JSON object, or bare text.
pub fn parse_stream_message(message: &str) -> Result<SynthesisApiParams, ApiError> {
    if message.trim_start().starts_with('{') {
        serde_json::from_str(message)
            .map_err(|e| ApiError::InvalidInput(format!("Invalid request: {e}")))
    } else {
        Ok(SynthesisApiParams {
            text: message.to_string(),
            ..Default::default()
        })
    }
}

/// Rewrite text into a form the phonemizer reads well.
///
/// Trims, terminates unpunctuated text with a comma, and folds ellipses, smart
/// quotes and dashes into plain punctuation.
pub fn normalize_text(text: &str) -> String {
    let mut text = text.trim_matches([' ', '\n', '\r', '\t']).to_string();
    match text.chars().last() {
        None => return text,
        Some(c) if ".,!?;:…".contains(c) => {}
        Some(_) => text.push(','),
    }

    let mut out = String::with_capacity(text.len());
    let mut dots = 0usize;
    for ch in text.chars() {
        if ch == '.' {
            dots += 1;
            continue;
        }
        match dots {
            0 => {}
            1 => out.push('.'),
            _ => out.push(','),
        }
        dots = 0;
        out.push(ch);
    }
    match dots {
        0 => {}
        1 => out.push('.'),
        _ => out.push(','),
    }

    out.replace('…', ",")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{2014}', ", ")
        .replace(" - ", ", ")
}
