//! Error taxonomy for the synthesis engine.

use std::fmt;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SynthesisError>;

/// Which network a failed inference call belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStage {
    Encoder,
    Decoder,
}

impl fmt::Display for InferenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceStage::Encoder => f.write_str("encoder"),
            InferenceStage::Decoder => f.write_str("decoder"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Invalid voice configuration (phoneme maps, silence table, JSON shape).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A model or accelerator context could not be created.
    #[error("resource initialization failed: {0}")]
    ResourceInit(String),

    /// A single encode/decode call failed.
    #[error("{stage} inference failed: {source}")]
    Inference {
        stage: InferenceStage,
        #[source]
        source: anyhow::Error,
    },

    /// Tensor shapes broke an invariant the pipeline relies on.
    #[error("data invariant violated: {0}")]
    DataInvariant(String),

    #[error("phonemization failed: {0}")]
    Phonemize(#[source] anyhow::Error),

    /// The accelerator pool was shut down while (or before) waiting on it.
    #[error("accelerator context pool is closed")]
    PoolClosed,

    #[error("synthesis cancelled")]
    Cancelled,

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("wav encoding failed: {0}")]
    Wav(String),
}

impl SynthesisError {
    pub fn encoder(source: anyhow::Error) -> Self {
        SynthesisError::Inference {
            stage: InferenceStage::Encoder,
            source,
        }
    }

    pub fn decoder(source: anyhow::Error) -> Self {
        SynthesisError::Inference {
            stage: InferenceStage::Decoder,
            source,
        }
    }

    /// True when synthesis stopped because its cancellation token fired.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SynthesisError::Cancelled)
    }
}

impl From<hound::Error> for SynthesisError {
    fn from(e: hound::Error) -> Self {
        SynthesisError::Wav(e.to_string())
    }
}
