// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, TrainingMode};
use crate::tensor::{PureResult, Tensor, TensorError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::{Cell, RefCell};

/// Channel-wise dropout in the `nn.Dropout2d` style.
///
/// Entire feature maps are zeroed together rather than individual
/// activations, which is the right regulariser for spatially correlated
/// convolutional features. Survivors are rescaled by `1 / (1 - p)` so the
/// expected activation is unchanged.
pub struct Dropout2d {
    probability: f32,
    keep_scale: f32,
    channels: usize,
    train: Cell<bool>,
    rng: RefCell<StdRng>,
}

impl core::fmt::Debug for Dropout2d {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dropout2d")
            .field("probability", &self.probability)
            .field("channels", &self.channels)
            .field("training", &self.train.get())
            .finish()
    }
}

impl Dropout2d {
    /// Builds a channel dropout layer using entropy from the host.
    pub fn new(probability: f32, channels: usize) -> PureResult<Self> {
        Self::with_seed(probability, channels, None)
    }

    /// Builds a channel dropout layer with a deterministic RNG seed.
    pub fn with_seed(probability: f32, channels: usize, seed: Option<u64>) -> PureResult<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(TensorError::DropoutOutOfRange { probability });
        }
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        let keep_scale = 1.0 / (1.0 - probability);
        let rng = match seed {
            Some(value) => StdRng::seed_from_u64(value),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            probability,
            keep_scale,
            channels,
            train: Cell::new(false),
            rng: RefCell::new(rng),
        })
    }

    /// Returns the probability of zeroing a channel.
    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Returns whether the layer currently runs in training mode.
    pub fn is_training(&self) -> bool {
        self.train.get()
    }

    /// Switches the layer between stochastic and passthrough behaviour.
    pub fn set_mode(&self, mode: TrainingMode) {
        self.train.set(mode.is_train());
    }
}

impl Module for Dropout2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.is_empty() {
            return Err(TensorError::EmptyInput("dropout2d_forward"));
        }
        let (batch, cols) = input.shape();
        if cols % self.channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.channels),
            });
        }
        if !self.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let spatial = cols / self.channels;
        let mut output = input.clone();
        let mut rng = self.rng.borrow_mut();
        {
            let data = output.data_mut();
            for b in 0..batch {
                for c in 0..self.channels {
                    let scale = if rng.gen::<f32>() < self.probability {
                        0.0
                    } else {
                        self.keep_scale
                    };
                    let start = b * cols + c * spatial;
                    for value in &mut data[start..start + spatial] {
                        *value *= scale;
                    }
                }
            }
        }
        Ok(output)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_probability_outside_unit_interval() {
        assert!(Dropout2d::with_seed(-0.1, 4, Some(1)).is_err());
        assert!(Dropout2d::with_seed(1.0, 4, Some(1)).is_err());
        assert!(Dropout2d::with_seed(0.0, 4, Some(1)).is_ok());
    }

    #[test]
    fn eval_mode_is_a_passthrough() {
        let dropout = Dropout2d::with_seed(0.5, 2, Some(7)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let output = dropout.forward(&input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn training_zeroes_whole_channels() {
        let dropout = Dropout2d::with_seed(0.5, 3, Some(42)).unwrap();
        dropout.set_mode(TrainingMode::Train);
        let input = Tensor::from_vec(2, 6, vec![1.0; 12]).unwrap();
        let output = dropout.forward(&input).unwrap();
        // Each channel is either fully zero or fully rescaled.
        let spatial = 2;
        for b in 0..2 {
            for c in 0..3 {
                let start = b * 6 + c * spatial;
                let slice = &output.data()[start..start + spatial];
                assert!(
                    slice.iter().all(|v| *v == 0.0) || slice.iter().all(|v| (*v - 2.0).abs() < 1e-6)
                );
            }
        }
    }

    #[test]
    fn zero_probability_never_drops() {
        let dropout = Dropout2d::with_seed(0.0, 2, Some(3)).unwrap();
        dropout.set_mode(TrainingMode::Train);
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = dropout.forward(&input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn forward_rejects_non_divisible_width() {
        let dropout = Dropout2d::with_seed(0.5, 3, Some(1)).unwrap();
        let input = Tensor::zeros(1, 4).unwrap();
        assert!(dropout.forward(&input).is_err());
    }
}
