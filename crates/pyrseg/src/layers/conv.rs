// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, ParamKind, Parameter};
use crate::tensor::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize, _label: &str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

/// Output extent of a convolution over `input_hw`.
pub fn conv_output_hw(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
) -> PureResult<(usize, usize)> {
    let (h, w) = input_hw;
    if h == 0 || w == 0 {
        return Err(TensorError::InvalidDimensions { rows: h, cols: w });
    }
    if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: kernel.0.min(stride.0),
            cols: kernel.1.min(stride.1),
        });
    }
    if dilation.0 == 0 || dilation.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: dilation.0,
            cols: dilation.1,
        });
    }
    let effective_kh = (kernel.0 - 1) * dilation.0 + 1;
    let effective_kw = (kernel.1 - 1) * dilation.1 + 1;
    if h + 2 * padding.0 < effective_kh || w + 2 * padding.1 < effective_kw {
        return Err(TensorError::InvalidDimensions {
            rows: h + 2 * padding.0,
            cols: effective_kh.max(effective_kw),
        });
    }
    let oh = (h + 2 * padding.0 - effective_kh) / stride.0 + 1;
    let ow = (w + 2 * padding.1 - effective_kw) / stride.1 + 1;
    Ok((oh, ow))
}

/// Output extent of a pooling window over `input_hw`.
pub fn pool_output_hw(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PureResult<(usize, usize)> {
    conv_output_hw(input_hw, kernel, stride, padding, (1, 1))
}

/// Two-dimensional convolution over `(batch, channels * height * width)` maps.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(dilation.0, "dilation_h")?;
        validate_positive(dilation.1, "dilation_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let fan_scale = (2.0 / span as f32).sqrt();
        let mut seed = 0.37f32;
        let weight = Tensor::from_fn(out_channels, span, |_r, _c| {
            seed = (seed * 1.61 + 0.217).rem_euclid(1.0);
            (seed - 0.5) * 2.0 * fan_scale
        })?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight, ParamKind::ConvWeight),
            bias: Parameter::new(format!("{name}::bias"), bias, ParamKind::ConvBias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            dilation,
            input_hw,
        };
        // Validate the configuration by computing the output size once.
        conv.output_hw()?;
        Ok(conv)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        conv_output_hw(
            self.input_hw,
            self.kernel,
            self.stride,
            self.padding,
            self.dilation,
        )
    }

    fn expected_cols(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let span = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, span)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let (dilation_h, dilation_w) = self.dilation;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let offset = row_index * span;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let pos_h = oh_idx * self.stride.0 + kh * dilation_h;
                                    let pos_w = ow_idx * self.stride.1 + kw * dilation_w;
                                    let idx_h = pos_h as isize - pad_h;
                                    let idx_w = pos_w as isize - pad_w;
                                    column_data[offset + col_idx] = if idx_h < 0
                                        || idx_w < 0
                                        || idx_h >= h as isize
                                        || idx_w >= w as isize
                                    {
                                        0.0
                                    } else {
                                        row[channel_offset + idx_h as usize * w + idx_w as usize]
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        if cols != self.expected_cols() {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.expected_cols()),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        let contracted = patches.matmul(&self.weight.value().transpose())?;
        let spatial = oh * ow;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let bias = self.bias.value().data();
        {
            let contracted_data = contracted.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                for s in 0..spatial {
                    let src = (b * spatial + s) * self.out_channels;
                    for oc in 0..self.out_channels {
                        out_data[b * self.out_channels * spatial + oc * spatial + s] =
                            contracted_data[src + oc] + bias[oc];
                    }
                }
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

/// Max pooling over 2D feature maps.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        pool.output_hw()?;
        Ok(pool)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        pool_output_hw(self.input_hw, self.kernel, self.stride, self.padding)
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (h, w) = self.input_hw;
        let expected = self.channels * h * w;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let out_cols = self.channels * oh * ow;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut best = f32::MIN;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let pos_h = oh_idx * self.stride.0 + kh;
                                    let pos_w = ow_idx * self.stride.1 + kw;
                                    if pos_h < self.padding.0 || pos_w < self.padding.1 {
                                        continue;
                                    }
                                    let idx_h = pos_h - self.padding.0;
                                    let idx_w = pos_w - self.padding.1;
                                    if idx_h >= h || idx_w >= w {
                                        continue;
                                    }
                                    best = best.max(row[channel_offset + idx_h * w + idx_w]);
                                }
                            }
                            out_row[c * oh * ow + oh_idx * ow + ow_idx] = best;
                        }
                    }
                }
            }
        }
        Ok(out)
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

/// Average pooling onto a fixed target grid, independent of the input extent.
///
/// Bin `i` along an axis of length `n` covers `[floor(i*n/bins), ceil((i+1)*n/bins))`
/// so neighbouring bins overlap when `n` is not a multiple of `bins` and every
/// input cell contributes to at least one bin.
#[derive(Debug)]
pub struct AdaptiveAvgPool2d {
    channels: usize,
    input_hw: (usize, usize),
    output_hw: (usize, usize),
}

impl AdaptiveAvgPool2d {
    pub fn new(
        channels: usize,
        input_hw: (usize, usize),
        output_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        validate_positive(output_hw.0, "output_height")?;
        validate_positive(output_hw.1, "output_width")?;
        if output_hw.0 > input_hw.0 || output_hw.1 > input_hw.1 {
            return Err(TensorError::ShapeMismatch {
                left: input_hw,
                right: output_hw,
            });
        }
        Ok(Self {
            channels,
            input_hw,
            output_hw,
        })
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    fn bin_bounds(position: usize, input: usize, bins: usize) -> (usize, usize) {
        let start = position * input / bins;
        let end = ((position + 1) * input).div_ceil(bins);
        (start, end)
    }
}

impl Module for AdaptiveAvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (h, w) = self.input_hw;
        let expected = self.channels * h * w;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        let (oh, ow) = self.output_hw;
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let out_cols = self.channels * oh * ow;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        let (h0, h1) = Self::bin_bounds(oh_idx, h, oh);
                        for ow_idx in 0..ow {
                            let (w0, w1) = Self::bin_bounds(ow_idx, w, ow);
                            let mut acc = 0.0f32;
                            for ih in h0..h1 {
                                for iw in w0..w1 {
                                    acc += row[channel_offset + ih * w + iw];
                                }
                            }
                            let count = ((h1 - h0) * (w1 - w0)) as f32;
                            out_row[c * oh * ow + oh_idx * ow + ow_idx] = acc / count;
                        }
                    }
                }
            }
        }
        Ok(out)
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
    fn conv_output_hw_matches_stride_arithmetic() {
        assert_eq!(
            conv_output_hw((473, 473), (7, 7), (2, 2), (3, 3), (1, 1)).unwrap(),
            (237, 237)
        );
        assert_eq!(
            conv_output_hw((8, 8), (3, 3), (1, 1), (2, 2), (2, 2)).unwrap(),
            (8, 8)
        );
    }

    #[test]
    fn conv_rejects_kernel_larger_than_padded_input() {
        assert!(Conv2d::new("t", 1, 1, (5, 5), (1, 1), (0, 0), (1, 1), (3, 3)).is_err());
    }

    #[test]
    fn one_by_one_conv_scales_every_pixel() {
        let mut conv = Conv2d::new("t", 1, 1, (1, 1), (1, 1), (0, 0), (1, 1), (2, 2)).unwrap();
        conv.visit_parameters_mut(&mut |param| {
            let fill = if param.kind() == ParamKind::ConvWeight {
                2.0
            } else {
                0.5
            };
            for value in param.value_mut().data_mut() {
                *value = fill;
            }
            Ok(())
        })
        .unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), &[2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn conv_forward_validates_flattened_shape() {
        let conv = Conv2d::new("t", 2, 4, (3, 3), (1, 1), (1, 1), (1, 1), (4, 4)).unwrap();
        let bad = Tensor::zeros(1, 4 * 4).unwrap();
        assert!(conv.forward(&bad).is_err());
        let good = Tensor::zeros(1, 2 * 4 * 4).unwrap();
        let out = conv.forward(&good).unwrap();
        assert_eq!(out.shape(), (1, 4 * 4 * 4));
    }

    #[test]
    fn maxpool_picks_window_maximum() {
        let pool = MaxPool2d::new(1, (2, 2), (2, 2), (0, 0), (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 5.0, -2.0, 3.0]).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.data(), &[5.0]);
    }

    #[test]
    fn adaptive_pool_averages_exact_bins() {
        let pool = AdaptiveAvgPool2d::new(1, (2, 2), (1, 1)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.data(), &[2.5]);
    }

    #[test]
    fn adaptive_pool_covers_uneven_bins() {
        // 3 cells into 2 bins: [0, 2) and [1, 3).
        let pool = AdaptiveAvgPool2d::new(1, (1, 3), (1, 2)).unwrap();
        let input = Tensor::from_vec(1, 3, vec![0.0, 2.0, 4.0]).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.data(), &[1.0, 3.0]);
    }

    #[test]
    fn adaptive_pool_rejects_grid_finer_than_input() {
        assert!(AdaptiveAvgPool2d::new(1, (2, 2), (3, 3)).is_err());
    }
}
