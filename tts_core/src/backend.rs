//! Inference backends: the encoder and the decoder contexts the pool leases.

use std::path::Path;

use anyhow::{bail, Context};
use ndarray::{Array3, ArrayView3};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};

use crate::{
    config::{EngineConfig, PhonemeId, SpeakerId},
    error::{Result, SynthesisError},
    pool::AcceleratorContextPool,
    tensors::{LatentTensors, LatentWindow},
};

/// Scales and speaker passed to the encoder for one phrase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeParams {
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_w: f32,
    pub speaker_id: Option<SpeakerId>,
}

/// Phoneme ids to latent tensors. Shared by every worker thread.
pub trait Encoder: Send + Sync {
    fn encode(&self, ids: &[PhonemeId], params: &EncodeParams) -> anyhow::Result<LatentTensors>;
}

/// One decoder context: latent window to 16-bit PCM.
///
/// Must accept windows shorter than a full chunk.
pub trait DecoderBackend: Send {
    fn infer(&mut self, window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>>;
}

impl<T: DecoderBackend + ?Sized> DecoderBackend for Box<T> {
    fn infer(&mut self, window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>> {
        (**self).infer(window)
    }
}

pub type DecoderPool = AcceleratorContextPool<Box<dyn DecoderBackend>>;

fn build_session(path: &Path, accelerator: &str) -> anyhow::Result<Session> {
    #[allow(unused_mut)]
    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level2)?;

    match accelerator {
        "" | "cpu" => {}
        #[cfg(feature = "cuda")]
        "cuda" => {
            use ort::execution_providers::CUDAExecutionProvider;
            builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }
        other => {
            tracing::warn!(accelerator = other, "accelerator not available, using CPU");
        }
    }

    builder
        .commit_from_file(path)
        .with_context(|| format!("failed to load model {}", path.display()))
}

/// Encoder network running on ONNX Runtime.
pub struct OnnxEncoder {
    session: Session,
    takes_speaker: bool,
}

impl OnnxEncoder {
    pub fn load(path: &Path, accelerator: &str) -> anyhow::Result<Self> {
        let session = build_session(path, accelerator)?;
        let takes_speaker = session.inputs.iter().any(|input| input.name == "sid");
        tracing::debug!(path = %path.display(), takes_speaker, "encoder loaded");
        Ok(Self { session, takes_speaker })
    }
}

impl Encoder for OnnxEncoder {
    fn encode(&self, ids: &[PhonemeId], params: &EncodeParams) -> anyhow::Result<LatentTensors> {
        let n = ids.len();
        let input = Tensor::from_array(([1usize, n], ids.to_vec()))?;
        let input_lengths = Tensor::from_array(([1usize], vec![n as i64]))?;
        let scales = Tensor::from_array((
            [3usize],
            vec![params.noise_scale, params.length_scale, params.noise_w],
        ))?;

        let mut inputs = ort::inputs![
            "input" => input,
            "input_lengths" => input_lengths,
            "scales" => scales,
        ]?;
        if self.takes_speaker {
            let sid = Tensor::from_array(([1usize], vec![params.speaker_id.unwrap_or(0)]))?;
            inputs.push(("sid".into(), sid.into()));
        }

        let outputs = self.session.run(inputs)?;
        let z = to_array3(required(&outputs, "z")?.try_extract_tensor::<f32>()?, "z")?;
        let y_mask = to_array3(required(&outputs, "y_mask")?.try_extract_tensor::<f32>()?, "y_mask")?;
        let g = match outputs.get("g") {
            Some(g) => Some(to_array3(g.try_extract_tensor::<f32>()?, "g")?),
            None => None,
        };
        Ok(LatentTensors::new(z, y_mask, g)?)
    }
}

fn required<'a>(
    outputs: &'a ort::session::SessionOutputs<'_, '_>,
    name: &str,
) -> anyhow::Result<&'a ort::value::DynValue> {
    outputs
        .get(name)
        .with_context(|| format!("model has no output named {name}"))
}

fn to_array3(view: ndarray::ArrayViewD<'_, f32>, name: &str) -> anyhow::Result<Array3<f32>> {
    view.to_owned()
        .into_dimensionality()
        .with_context(|| format!("encoder output {name} is not rank 3"))
}

/// Decoder network running on ONNX Runtime.
///
/// With `fixed_window`, the graph only accepts that many slices: shorter
/// windows are zero-padded and the output is cut back proportionally.
pub struct OnnxDecoder {
    session: Session,
    fixed_window: Option<usize>,
}

impl OnnxDecoder {
    pub fn load(path: &Path, accelerator: &str, fixed_window: Option<usize>) -> anyhow::Result<Self> {
        Ok(Self {
            session: build_session(path, accelerator)?,
            fixed_window,
        })
    }
}

fn pad_slices(view: ArrayView3<'_, f32>, len: usize) -> Array3<f32> {
    let (b, c, t) = view.dim();
    let mut out = Array3::zeros((b, c, len));
    out.slice_mut(ndarray::s![.., .., ..t]).assign(&view);
    out
}

impl DecoderBackend for OnnxDecoder {
    fn infer(&mut self, window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>> {
        let n = window.nslices();
        let (z, y_mask) = match self.fixed_window {
            Some(fixed) if n > fixed => {
                bail!(SynthesisError::DataInvariant(format!(
                    "window of {n} slices exceeds the decoder's fixed size {fixed}"
                )))
            }
            Some(fixed) => (pad_slices(window.z, fixed), pad_slices(window.y_mask, fixed)),
            None => (window.z.to_owned(), window.y_mask.to_owned()),
        };

        let mut inputs = ort::inputs![
            "z" => Tensor::from_array(z)?,
            "y_mask" => Tensor::from_array(y_mask)?,
        ]?;
        if let Some(g) = window.g {
            inputs.push(("g".into(), Tensor::from_array(g.to_owned())?.into()));
        }

        let outputs = self.session.run(inputs)?;
        let audio = required(&outputs, "output")?.try_extract_tensor::<f32>()?;
        let mut samples: Vec<i16> = audio
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        if let Some(fixed) = self.fixed_window {
            let keep = samples.len() * n / fixed;
            samples.truncate(keep);
        }
        Ok(samples)
    }
}

/// Load the decoder named by `config` into a pool of `decoder_contexts`
/// independent sessions.
pub fn load_decoder_pool(config: &EngineConfig) -> Result<DecoderPool> {
    let path = config.decoder_path.as_path();
    match path.extension().and_then(|e| e.to_str()) {
        Some("onnx") => {}
        other => {
            return Err(SynthesisError::ResourceInit(format!(
                "unsupported decoder model format {:?} ({})",
                other.unwrap_or(""),
                path.display()
            )))
        }
    }
    AcceleratorContextPool::initialize(config.decoder_contexts, |core| {
        tracing::debug!(core, path = %path.display(), "creating decoder context");
        let decoder = OnnxDecoder::load(path, &config.accelerator, config.decoder_fixed_window)?;
        Ok(Box::new(decoder) as Box<dyn DecoderBackend>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use std::path::PathBuf;

    struct Fixed(Vec<i16>);

    impl DecoderBackend for Fixed {
        fn infer(&mut self, _window: LatentWindow<'_>) -> anyhow::Result<Vec<i16>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_boxed_backend_delegates() {
        let mut boxed: Box<dyn DecoderBackend> = Box::new(Fixed(vec![1, 2, 3]));
        let latents = LatentTensors::new(Array3::zeros((1, 1, 2)), Array3::zeros((1, 1, 2)), None).unwrap();
        assert_eq!(boxed.infer(latents.full()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_pad_slices_zero_fills() {
        let src = Array3::from_elem((1, 2, 3), 1.0f32);
        let padded = pad_slices(src.view(), 5);
        assert_eq!(padded.dim(), (1, 2, 5));
        assert_eq!(padded.index_axis(Axis(2), 2).sum(), 2.0);
        assert_eq!(padded.index_axis(Axis(2), 3).sum(), 0.0);
    }

    #[test]
    fn test_unknown_decoder_format_rejected() {
        let config = EngineConfig {
            decoder_path: PathBuf::from("voice/decoder.rknn"),
            ..Default::default()
        };
        let err = load_decoder_pool(&config).unwrap_err();
        assert!(matches!(err, SynthesisError::ResourceInit(_)));
        assert!(err.to_string().contains("rknn"));
    }
}
