// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, ParamKind, Parameter, TrainingMode};
use crate::tensor::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// Batch normalisation over the channel axis of flattened 2D feature maps.
///
/// Statistics are computed per channel across the batch and both spatial
/// axes. In [`TrainingMode::Eval`] the stored running statistics are used
/// instead of the batch statistics, which is what the partial-freeze policy
/// relies on to pin a pretrained backbone's activations.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    spatial: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
}

impl BatchNorm2d {
    /// Creates a batch normalisation layer for `channels` maps of
    /// `input_hw` spatial extent.
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        input_hw: (usize, usize),
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        if input_hw.0 == 0 || input_hw.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_hw.0,
                cols: input_hw.1,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        let running_mean = Tensor::zeros(1, channels)?;
        let running_var = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        Ok(Self {
            channels,
            spatial: input_hw.0 * input_hw.1,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), gamma, ParamKind::NormScaleShift),
            beta: Parameter::new(format!("{name}::beta"), beta, ParamKind::NormScaleShift),
            running_mean: RefCell::new(running_mean),
            running_var: RefCell::new(running_var),
            training: Cell::new(false),
        })
    }

    /// Number of normalised channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the momentum applied to the running statistics.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Returns the epsilon used to stabilise the variance estimate.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Current mode of the layer.
    pub fn mode(&self) -> TrainingMode {
        if self.training.get() {
            TrainingMode::Train
        } else {
            TrainingMode::Eval
        }
    }

    /// Switches the layer between batch and running statistics.
    pub fn set_mode(&self, mode: TrainingMode) {
        self.training.set(mode.is_train());
    }

    /// Pins the layer to its running statistics and stops its affine
    /// parameters from being updated. Used by the partial-freeze policy.
    pub fn freeze(&mut self) {
        self.training.set(false);
        self.gamma.set_trainable(false);
        self.beta.set_trainable(false);
    }

    /// Whether the affine parameters are currently frozen.
    pub fn is_frozen(&self) -> bool {
        !self.gamma.is_trainable() && !self.beta.is_trainable()
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        let expected = self.channels * self.spatial;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, expected),
            });
        }
        if rows == 0 {
            return Err(TensorError::EmptyInput("batchnorm_input"));
        }
        Ok(())
    }

    fn compute_stats(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        let (batch, cols) = input.shape();
        let mut mean = vec![0.0f32; self.channels];
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                let slice = &row[c * self.spatial..(c + 1) * self.spatial];
                mean[c] += slice.iter().sum::<f32>();
            }
        }
        let scale = 1.0 / (batch * self.spatial) as f32;
        for value in mean.iter_mut() {
            *value *= scale;
        }
        let mut variance = vec![0.0f32; self.channels];
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                let slice = &row[c * self.spatial..(c + 1) * self.spatial];
                for value in slice {
                    let centered = *value - mean[c];
                    variance[c] += centered * centered;
                }
            }
        }
        for value in variance.iter_mut() {
            *value *= scale;
        }
        (mean, variance)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (batch, cols) = input.shape();
        let (mean, variance) = if self.training.get() {
            let (mean, variance) = self.compute_stats(input);
            {
                let mut running_mean = self.running_mean.borrow_mut();
                let data = running_mean.data_mut();
                for c in 0..self.channels {
                    data[c] = self.momentum * mean[c] + (1.0 - self.momentum) * data[c];
                }
            }
            {
                let mut running_var = self.running_var.borrow_mut();
                let data = running_var.data_mut();
                for c in 0..self.channels {
                    data[c] = self.momentum * variance[c] + (1.0 - self.momentum) * data[c];
                }
            }
            (mean, variance)
        } else {
            let running_mean = self.running_mean.borrow();
            let running_var = self.running_var.borrow();
            (running_mean.data().to_vec(), running_var.data().to_vec())
        };
        let inv_std: Vec<f32> = variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut output = Vec::with_capacity(batch * cols);
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                let slice = &row[c * self.spatial..(c + 1) * self.spatial];
                for value in slice {
                    let normed = (*value - mean[c]) * inv_std[c];
                    output.push(normed * gamma[c] + beta[c]);
                }
            }
        }
        Tensor::from_vec(batch, cols, output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}
