//! Streaming two-stage neural TTS engine.
//!
//! Phoneme ids go through an encoder into latent tensors, which a pool of
//! decoder contexts turns into 16-bit PCM in overlapping chunks. Sentences
//! run in parallel; audio is delivered to the caller in input order.

pub mod backend;
pub mod cancel;
pub mod chunked;
pub mod config;
pub mod driver;
pub mod error;
pub mod phonemes;
pub mod pool;
pub mod scheduler;
pub mod sentence;
pub mod sink;
pub mod stats;
pub mod tensors;
pub mod wav;

pub use backend::{DecoderBackend, DecoderPool, EncodeParams, Encoder, OnnxDecoder, OnnxEncoder};
pub use cancel::CancellationToken;
pub use chunked::{ChunkedDecoder, DecodeStats};
pub use config::{EngineConfig, PhonemeType, SpeakerId, SynthesisConfig, VoiceConfig};
pub use driver::{SynthesisDriver, SynthesisRequest, Voice};
pub use error::{Result, SynthesisError};
pub use phonemes::{CodepointPhonemizer, Diacritizer, MissingPhonemes, Phonemizer, Sentence};
pub use pool::{AcceleratorContextPool, ContextLease};
pub use scheduler::{ParallelSynthesisScheduler, WorkerPool};
pub use sentence::{segment_phrases, Phrase, SentenceSynthesizer, SynthesisParams};
pub use sink::{AudioSink, PcmWriter, RecordingSink};
pub use stats::SynthesisResult;
pub use tensors::{LatentTensors, LatentWindow};
