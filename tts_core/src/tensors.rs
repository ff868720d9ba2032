use ndarray::{s, Array3, ArrayView3};

use crate::error::{Result, SynthesisError};

/// Encoder output: latent `z`, its mask, and optional speaker conditioning `g`.
///
/// `z` and `y_mask` are laid out `[batch, channels, slices]` and share the
/// temporal axis.
#[derive(Debug, Clone)]
pub struct LatentTensors {
    pub z: Array3<f32>,
    pub y_mask: Array3<f32>,
    pub g: Option<Array3<f32>>,
}

/// A borrowed temporal window of [`LatentTensors`].
#[derive(Debug, Clone, Copy)]
pub struct LatentWindow<'a> {
    pub z: ArrayView3<'a, f32>,
    pub y_mask: ArrayView3<'a, f32>,
    pub g: Option<ArrayView3<'a, f32>>,
}

impl LatentTensors {
    pub fn new(z: Array3<f32>, y_mask: Array3<f32>, g: Option<Array3<f32>>) -> Result<Self> {
        let tensors = Self { z, y_mask, g };
        tensors.nslices()?;
        Ok(tensors)
    }

    /// Length of the shared temporal axis.
    pub fn nslices(&self) -> Result<usize> {
        let z = self.z.shape()[2];
        let mask = self.y_mask.shape()[2];
        if z != mask {
            return Err(SynthesisError::DataInvariant(format!(
                "z and y_mask must have the same number of slices ({z} != {mask})"
            )));
        }
        Ok(z)
    }

    /// The whole tensor as one window.
    pub fn full(&self) -> LatentWindow<'_> {
        LatentWindow {
            z: self.z.view(),
            y_mask: self.y_mask.view(),
            g: self.g.as_ref().map(|g| g.view()),
        }
    }

    /// Slices `[start, end)` of z and y_mask; `g` is passed through unchanged.
    pub fn window(&self, start: usize, end: usize) -> LatentWindow<'_> {
        LatentWindow {
            z: self.z.slice(s![.., .., start..end]),
            y_mask: self.y_mask.slice(s![.., .., start..end]),
            g: self.g.as_ref().map(|g| g.view()),
        }
    }
}

impl LatentWindow<'_> {
    pub fn nslices(&self) -> usize {
        self.z.shape()[2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_mismatch_is_invariant_error() {
        let err = LatentTensors::new(
            Array3::zeros((1, 4, 10)),
            Array3::zeros((1, 1, 9)),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SynthesisError::DataInvariant(_)));
    }

    #[test]
    fn test_window_keeps_g() {
        let latents = LatentTensors::new(
            Array3::from_shape_fn((1, 2, 10), |(_, _, t)| t as f32),
            Array3::ones((1, 1, 10)),
            Some(Array3::ones((1, 8, 1))),
        )
        .unwrap();
        let w = latents.window(3, 7);
        assert_eq!(w.nslices(), 4);
        assert_eq!(w.z[[0, 1, 0]], 3.0);
        assert_eq!(w.g.unwrap().shape(), &[1, 8, 1]);
    }
}
