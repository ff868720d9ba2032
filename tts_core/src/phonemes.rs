//! Text to phonemes, phonemes to model ids.

use std::{
    collections::BTreeMap,
    process::{Command, Stdio},
    sync::Mutex,
};

use anyhow::{bail, Context};

use crate::config::{Phoneme, PhonemeId, PhonemizeConfig};

/// A sentence as a sequence of phoneme codepoints.
pub type Sentence = Vec<Phoneme>;

/// Turns text into ordered sentences of phonemes. Must be callable from any thread.
pub trait Phonemizer: Send + Sync {
    fn phonemize(&self, text: &str) -> anyhow::Result<Vec<Sentence>>;
}

/// A phonemizer that is not reentrant.
pub trait PhonemizeMut: Send {
    fn phonemize_mut(&mut self, text: &str) -> anyhow::Result<Vec<Sentence>>;
}

/// Serializes calls into a non-reentrant phonemizer.
///
/// The lock is held only for the phonemize call itself.
pub struct Serialized<P> {
    inner: Mutex<P>,
}

impl<P: PhonemizeMut> Serialized<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<P: PhonemizeMut> Phonemizer for Serialized<P> {
    fn phonemize(&self, text: &str) -> anyhow::Result<Vec<Sentence>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("phonemizer lock poisoned"))?;
        inner.phonemize_mut(text)
    }
}

/// Optional text rewrite applied before phonemization (e.g. adding diacritics).
pub trait Diacritizer: Send + Sync {
    fn diacritize(&self, text: &str) -> anyhow::Result<String>;
}

fn apply_phoneme_map(sentence: Sentence, map: Option<&BTreeMap<Phoneme, Vec<Phoneme>>>) -> Sentence {
    match map {
        None => sentence,
        Some(map) => sentence
            .into_iter()
            .flat_map(|p| match map.get(&p) {
                Some(to) => to.clone(),
                None => vec![p],
            })
            .collect(),
    }
}

/// Phonemizer for `phoneme_type: "text"` voices: every codepoint is a phoneme.
#[derive(Debug, Clone, Default)]
pub struct CodepointPhonemizer {
    phoneme_map: Option<BTreeMap<Phoneme, Vec<Phoneme>>>,
}

impl CodepointPhonemizer {
    pub fn new(config: &PhonemizeConfig) -> Self {
        Self {
            phoneme_map: config.phoneme_map.clone(),
        }
    }
}

impl Phonemizer for CodepointPhonemizer {
    fn phonemize(&self, text: &str) -> anyhow::Result<Vec<Sentence>> {
        let mut sentences = Vec::new();
        let mut current = Sentence::new();
        for c in text.chars().flat_map(char::to_lowercase) {
            if current.is_empty() && c.is_whitespace() {
                continue;
            }
            current.push(c);
            if matches!(c, '.' | '!' | '?') {
                sentences.push(std::mem::take(&mut current));
            }
        }
        if current.iter().any(|c| !c.is_whitespace()) {
            sentences.push(current);
        }
        Ok(sentences
            .into_iter()
            .map(|s| apply_phoneme_map(s, self.phoneme_map.as_ref()))
            .collect())
    }
}

/// IPA phonemization through the `espeak-ng` command line.
///
/// Each non-empty output line is one sentence.
#[derive(Debug, Clone)]
pub struct EspeakPhonemizer {
    program: String,
    voice: String,
    phoneme_map: Option<BTreeMap<Phoneme, Vec<Phoneme>>>,
}

impl EspeakPhonemizer {
    pub fn new(config: &PhonemizeConfig) -> Self {
        Self {
            program: "espeak-ng".to_string(),
            voice: config.espeak_voice.clone(),
            phoneme_map: config.phoneme_map.clone(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Phonemizer for EspeakPhonemizer {
    fn phonemize(&self, text: &str) -> anyhow::Result<Vec<Sentence>> {
        let output = Command::new(&self.program)
            .args(["-q", "--ipa", "-v", &self.voice, text])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to run phonemizer '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("phonemizer '{}' failed: {}", self.program, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout).context("phonemizer emitted non-utf8 output")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| apply_phoneme_map(line.chars().collect(), self.phoneme_map.as_ref()))
            .collect())
    }
}

/// Per-phoneme counts of phonemes absent from the id map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingPhonemes(BTreeMap<Phoneme, usize>);

impl MissingPhonemes {
    pub fn record(&mut self, phoneme: Phoneme) {
        *self.0.entry(phoneme).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &MissingPhonemes) {
        for (&p, &n) in &other.0 {
            *self.0.entry(p).or_insert(0) += n;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Distinct missing phonemes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn count(&self, phoneme: Phoneme) -> usize {
        self.0.get(&phoneme).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phoneme, usize)> + '_ {
        self.0.iter().map(|(&p, &n)| (p, n))
    }

    /// Emit one warning per missing phoneme.
    pub fn log(&self) {
        if self.is_empty() {
            return;
        }
        tracing::warn!(distinct = self.len(), "phonemes missing from the id map");
        for (phoneme, count) in self.iter() {
            tracing::warn!(%phoneme, codepoint = phoneme as u32, count, "missing phoneme");
        }
    }
}

/// Maps phonemes to model ids: `bos pad (ids pad)* eos`.
#[derive(Debug, Clone)]
pub struct PhonemeIdMapper {
    ids: BTreeMap<Phoneme, Vec<PhonemeId>>,
    pad: PhonemeId,
    bos: PhonemeId,
    eos: PhonemeId,
    intersperse_pad: bool,
}

impl PhonemeIdMapper {
    pub fn new(config: &PhonemizeConfig) -> Self {
        Self {
            ids: config.phoneme_id_map.clone(),
            pad: config.id_pad,
            bos: config.id_bos,
            eos: config.id_eos,
            intersperse_pad: config.intersperse_pad,
        }
    }

    pub fn ids_for(&self, phrase: &[Phoneme], missing: &mut MissingPhonemes) -> Vec<PhonemeId> {
        let mut out = Vec::with_capacity(phrase.len() * 2 + 3);
        out.push(self.bos);
        if self.intersperse_pad {
            out.push(self.pad);
        }
        for &phoneme in phrase {
            match self.ids.get(&phoneme) {
                Some(ids) => {
                    out.extend_from_slice(ids);
                    if self.intersperse_pad {
                        out.push(self.pad);
                    }
                }
                None => missing.record(phoneme),
            }
        }
        out.push(self.eos);
        out
    }

    /// Count the phonemes in `phonemes` that have no id, without mapping.
    pub fn record_missing(&self, phonemes: &[Phoneme], missing: &mut MissingPhonemes) {
        for &phoneme in phonemes {
            if !self.ids.contains_key(&phoneme) {
                missing.record(phoneme);
            }
        }
    }
}
