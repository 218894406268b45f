// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Multi-scale context pooling over a dense feature map.
//!
//! Each scale pools the feature map onto a coarse grid, remixes it with a
//! 1x1 convolution, and upsamples it back to the source extent. The branch
//! outputs are concatenated with the untouched input, so the channel count
//! grows from `d` to `d * (scales + 1)`.

use crate::layers::{bilinear_resize, AdaptiveAvgPool2d, BatchNorm2d, Conv2d, Relu};
use crate::module::{Module, Parameter, TrainingMode};
use crate::tensor::{PureResult, Tensor, TensorError};

const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1e-5;

#[derive(Debug)]
struct ScaleBranch {
    scale: usize,
    pool: AdaptiveAvgPool2d,
    conv: Conv2d,
    bn: BatchNorm2d,
    relu: Relu,
}

/// Pyramid pooling head in the PSP style.
#[derive(Debug)]
pub struct PyramidContextPool {
    in_channels: usize,
    input_hw: (usize, usize),
    branches: Vec<ScaleBranch>,
}

impl PyramidContextPool {
    /// Builds one pooling branch per scale over a `d`-channel feature map
    /// of `input_hw` extent. A scale `s` pools onto a grid of
    /// `(min(s, h), min(s, w))`, so larger scales sample the map more
    /// finely and a scale at or above the extent degenerates to identity
    /// resolution.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        input_hw: (usize, usize),
        scales: &[usize],
    ) -> PureResult<Self> {
        if in_channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: in_channels,
            });
        }
        if scales.is_empty() {
            return Err(TensorError::EmptyScaleSeries);
        }
        let name = name.into();
        let (h, w) = input_hw;
        let mut branches = Vec::with_capacity(scales.len());
        for &scale in scales {
            if scale == 0 {
                return Err(TensorError::InvalidValue {
                    label: "pyramid_scale",
                });
            }
            let grid = (scale.min(h), scale.min(w));
            let branch_name = format!("{name}::scale{scale}");
            let pool = AdaptiveAvgPool2d::new(in_channels, input_hw, grid)?;
            let conv = Conv2d::new(
                format!("{branch_name}::conv"),
                in_channels,
                in_channels,
                (1, 1),
                (1, 1),
                (0, 0),
                (1, 1),
                grid,
            )?;
            let bn = BatchNorm2d::new(
                format!("{branch_name}::bn"),
                in_channels,
                grid,
                BN_MOMENTUM,
                BN_EPSILON,
            )?;
            branches.push(ScaleBranch {
                scale,
                pool,
                conv,
                bn,
                relu: Relu::new(),
            });
        }
        Ok(Self {
            in_channels,
            input_hw,
            branches,
        })
    }

    /// Channel count of the concatenated output.
    pub fn feature_dim(&self) -> usize {
        self.in_channels * (self.branches.len() + 1)
    }

    /// Scales this pool was built with, in declaration order.
    pub fn scales(&self) -> Vec<usize> {
        self.branches.iter().map(|branch| branch.scale).collect()
    }

    /// Spatial extent of input and output feature maps.
    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Switches the branch normalisation layers between batch and running
    /// statistics.
    pub fn set_mode(&self, mode: TrainingMode) {
        for branch in &self.branches {
            branch.bn.set_mode(mode);
        }
    }
}

impl Module for PyramidContextPool {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (h, w) = self.input_hw;
        let expected = self.in_channels * h * w;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        let mut branch_maps = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let pooled = branch.pool.forward(input)?;
            let mixed = branch.relu.forward(&branch.bn.forward(&branch.conv.forward(&pooled)?)?)?;
            let restored =
                bilinear_resize(&mixed, self.in_channels, branch.pool.output_hw(), (h, w))?;
            branch_maps.push(restored);
        }
        // Identity channels first, then one block of channels per scale.
        let out_cols = self.feature_dim() * h * w;
        let mut out = Tensor::zeros(batch, out_cols)?;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                out_row[..expected].copy_from_slice(&input.data()[b * expected..(b + 1) * expected]);
                for (idx, map) in branch_maps.iter().enumerate() {
                    let offset = (idx + 1) * expected;
                    out_row[offset..offset + expected]
                        .copy_from_slice(&map.data()[b * expected..(b + 1) * expected]);
                }
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &self.branches {
            branch.conv.visit_parameters(visitor)?;
            branch.bn.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &mut self.branches {
            branch.conv.visit_parameters_mut(visitor)?;
            branch.bn.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_scale_series() {
        let err = PyramidContextPool::new("psp", 4, (8, 8), &[]).unwrap_err();
        assert_eq!(err, TensorError::EmptyScaleSeries);
    }

    #[test]
    fn rejects_zero_scale() {
        assert!(PyramidContextPool::new("psp", 4, (8, 8), &[0, 2]).is_err());
    }

    #[test]
    fn feature_dim_counts_identity_and_branches() {
        let pool = PyramidContextPool::new("psp", 8, (4, 4), &[1, 2, 3, 6]).unwrap();
        assert_eq!(pool.feature_dim(), 8 * 5);
        assert_eq!(pool.scales(), vec![1, 2, 3, 6]);
    }

    #[test]
    fn scales_beyond_extent_clamp_to_identity_grid() {
        // Scale 6 over a 4x4 map pools onto 4x4.
        let pool = PyramidContextPool::new("psp", 2, (4, 4), &[6]).unwrap();
        let input = Tensor::zeros(1, 2 * 4 * 4).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.shape(), (1, 4 * 4 * 4));
    }

    #[test]
    fn forward_keeps_identity_channels_untouched() {
        let pool = PyramidContextPool::new("psp", 1, (2, 2), &[1]).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.shape(), (1, 8));
        assert_eq!(&out.data()[..4], input.data());
    }

    #[test]
    fn forward_rejects_wrong_width() {
        let pool = PyramidContextPool::new("psp", 2, (4, 4), &[1, 2]).unwrap();
        let input = Tensor::zeros(1, 4 * 4).unwrap();
        assert!(pool.forward(&input).is_err());
    }

    #[test]
    fn output_grows_with_batch() {
        let pool = PyramidContextPool::new("psp", 2, (4, 4), &[1, 2]).unwrap();
        let input = Tensor::zeros(3, 2 * 4 * 4).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.shape(), (3, 6 * 4 * 4));
    }
}
