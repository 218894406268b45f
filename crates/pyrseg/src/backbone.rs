// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dilated residual backbones for dense prediction.
//!
//! Every variant keeps an overall stride of 8: the stem and the first
//! pooling stage each halve the extent, the second stage halves it again,
//! and the last two stages trade their strides for dilations of 2 and 4 so
//! the feature map stays dense enough for segmentation.

use crate::layers::{BatchNorm2d, Conv2d, MaxPool2d, Relu};
use crate::module::{Module, Parameter, TrainingMode};
use crate::tensor::{PureResult, Tensor, TensorError};

const STEM_CHANNELS: usize = 64;
const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];
const STAGE_STRIDES: [usize; 4] = [1, 2, 1, 1];
const STAGE_DILATIONS: [usize; 4] = [1, 1, 2, 4];
const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1e-5;

/// ImageNet channel statistics the pretrained weights expect.
pub const INPUT_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const INPUT_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Known residual backbone variants keyed by their public identifier.
const REGISTRY: &[(&str, [usize; 4])] = &[
    ("resnet18", [2, 2, 2, 2]),
    ("resnet34", [3, 4, 6, 3]),
    ("resnet50", [3, 4, 6, 3]),
    ("resnet101", [3, 4, 23, 3]),
    ("resnet152", [3, 8, 36, 3]),
];

/// Identifiers accepted by [`build_backbone`].
pub fn backbone_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Looks the identifier up in the registry and constructs the backbone.
pub fn build_backbone(name: &str, input_hw: (usize, usize)) -> PureResult<ResNetBackbone> {
    let Some((_, blocks)) = REGISTRY.iter().find(|(known, _)| *known == name) else {
        return Err(TensorError::UnknownBackbone {
            name: name.to_string(),
        });
    };
    ResNetBackbone::new(name, *blocks, input_hw)
}

/// Two-convolution residual block with an optional projection shortcut.
#[derive(Debug)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<(Conv2d, BatchNorm2d)>,
    relu: Relu,
    output_hw: (usize, usize),
}

impl BasicBlock {
    fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dilation: usize,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        let conv1 = Conv2d::new(
            format!("{name}::conv1"),
            in_channels,
            out_channels,
            (3, 3),
            (stride, stride),
            (dilation, dilation),
            (dilation, dilation),
            input_hw,
        )?;
        let mid_hw = conv1.output_hw()?;
        let bn1 = BatchNorm2d::new(
            format!("{name}::bn1"),
            out_channels,
            mid_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        let conv2 = Conv2d::new(
            format!("{name}::conv2"),
            out_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (dilation, dilation),
            (dilation, dilation),
            mid_hw,
        )?;
        let output_hw = conv2.output_hw()?;
        let bn2 = BatchNorm2d::new(
            format!("{name}::bn2"),
            out_channels,
            output_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        let downsample = if stride != 1 || in_channels != out_channels {
            let conv = Conv2d::new(
                format!("{name}::down"),
                in_channels,
                out_channels,
                (1, 1),
                (stride, stride),
                (0, 0),
                (1, 1),
                input_hw,
            )?;
            let bn = BatchNorm2d::new(
                format!("{name}::down_bn"),
                out_channels,
                output_hw,
                BN_MOMENTUM,
                BN_EPSILON,
            )?;
            Some((conv, bn))
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
            relu: Relu::new(),
            output_hw,
        })
    }

    fn for_each_norm(&self, f: &mut dyn FnMut(&BatchNorm2d)) {
        f(&self.bn1);
        f(&self.bn2);
        if let Some((_, bn)) = &self.downsample {
            f(bn);
        }
    }

    fn for_each_norm_mut(&mut self, f: &mut dyn FnMut(&mut BatchNorm2d)) {
        f(&mut self.bn1);
        f(&mut self.bn2);
        if let Some((_, bn)) = &mut self.downsample {
            f(bn);
        }
    }
}

impl Module for BasicBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = self.relu.forward(&self.bn1.forward(&self.conv1.forward(input)?)?)?;
        out = self.bn2.forward(&self.conv2.forward(&out)?)?;
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward(&conv.forward(input)?)?,
            None => input.clone(),
        };
        self.relu.forward(&out.add(&identity)?)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.bn1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.bn2.visit_parameters(visitor)?;
        if let Some((conv, bn)) = &self.downsample {
            conv.visit_parameters(visitor)?;
            bn.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.bn2.visit_parameters_mut(visitor)?;
        if let Some((conv, bn)) = &mut self.downsample {
            conv.visit_parameters_mut(visitor)?;
            bn.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

/// Residual feature extractor with an overall stride of 8.
#[derive(Debug)]
pub struct ResNetBackbone {
    name: String,
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    relu: Relu,
    pool: MaxPool2d,
    stages: Vec<Vec<BasicBlock>>,
    input_hw: (usize, usize),
    output_hw: (usize, usize),
}

impl ResNetBackbone {
    fn new(name: &str, blocks: [usize; 4], input_hw: (usize, usize)) -> PureResult<Self> {
        let stem_conv = Conv2d::new(
            format!("{name}::stem"),
            3,
            STEM_CHANNELS,
            (7, 7),
            (2, 2),
            (3, 3),
            (1, 1),
            input_hw,
        )?;
        let stem_hw = stem_conv.output_hw()?;
        let stem_bn = BatchNorm2d::new(
            format!("{name}::stem_bn"),
            STEM_CHANNELS,
            stem_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        let pool = MaxPool2d::new(STEM_CHANNELS, (3, 3), (2, 2), (1, 1), stem_hw)?;
        let mut hw = pool.output_hw()?;
        let mut channels = STEM_CHANNELS;
        let mut stages = Vec::with_capacity(4);
        for stage in 0..4 {
            let mut layer = Vec::with_capacity(blocks[stage]);
            for block in 0..blocks[stage] {
                let stride = if block == 0 { STAGE_STRIDES[stage] } else { 1 };
                let built = BasicBlock::new(
                    &format!("{name}::layer{}::block{block}", stage + 1),
                    channels,
                    STAGE_CHANNELS[stage],
                    stride,
                    STAGE_DILATIONS[stage],
                    hw,
                )?;
                hw = built.output_hw;
                channels = STAGE_CHANNELS[stage];
                layer.push(built);
            }
            stages.push(layer);
        }
        Ok(Self {
            name: name.to_string(),
            stem_conv,
            stem_bn,
            relu: Relu::new(),
            pool,
            stages,
            input_hw,
            output_hw: hw,
        })
    }

    /// Registry identifier this backbone was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected spatial extent of the input image.
    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    /// Channel count of the produced feature map.
    pub fn feature_dim(&self) -> usize {
        STAGE_CHANNELS[3]
    }

    /// Per-channel mean the input image should be centred with.
    pub fn input_mean(&self) -> [f32; 3] {
        INPUT_MEAN
    }

    /// Per-channel standard deviation the input image should be scaled by.
    pub fn input_std(&self) -> [f32; 3] {
        INPUT_STD
    }

    /// Normalises a flattened RGB image batch in place using the channel
    /// statistics of the pretrained weights.
    pub fn normalize_image(&self, image: &mut Tensor) -> PureResult<()> {
        let (batch, cols) = image.shape();
        let spatial = self.input_hw.0 * self.input_hw.1;
        if cols != 3 * spatial {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, 3 * spatial),
            });
        }
        let data = image.data_mut();
        for b in 0..batch {
            for c in 0..3 {
                let start = b * cols + c * spatial;
                for value in &mut data[start..start + spatial] {
                    *value = (*value - INPUT_MEAN[c]) / INPUT_STD[c];
                }
            }
        }
        Ok(())
    }

    /// Switches every normalisation layer between batch and running stats.
    pub fn set_mode(&self, mode: TrainingMode) {
        self.for_each_norm(&mut |bn| bn.set_mode(mode));
    }

    /// Pins every normalisation layer to its running statistics and marks
    /// its affine parameters non-trainable. Returns the number of layers
    /// affected.
    pub fn freeze_norms(&mut self) -> usize {
        let mut frozen = 0usize;
        self.for_each_norm_mut(&mut |bn| {
            bn.freeze();
            frozen += 1;
        });
        frozen
    }

    fn for_each_norm(&self, f: &mut dyn FnMut(&BatchNorm2d)) {
        f(&self.stem_bn);
        for stage in &self.stages {
            for block in stage {
                block.for_each_norm(f);
            }
        }
    }

    fn for_each_norm_mut(&mut self, f: &mut dyn FnMut(&mut BatchNorm2d)) {
        f(&mut self.stem_bn);
        for stage in &mut self.stages {
            for block in stage {
                block.for_each_norm_mut(f);
            }
        }
    }
}

impl Module for ResNetBackbone {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = self
            .relu
            .forward(&self.stem_bn.forward(&self.stem_conv.forward(input)?)?)?;
        out = self.pool.forward(&out)?;
        for stage in &self.stages {
            for block in stage {
                out = block.forward(&out)?;
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters(visitor)?;
        self.stem_bn.visit_parameters(visitor)?;
        for stage in &self.stages {
            for block in stage {
                block.visit_parameters(visitor)?;
            }
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters_mut(visitor)?;
        self.stem_bn.visit_parameters_mut(visitor)?;
        for stage in &mut self.stages {
            for block in stage {
                block.visit_parameters_mut(visitor)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_identifier_is_rejected() {
        let err = build_backbone("densenet", (32, 32)).unwrap_err();
        assert!(matches!(err, TensorError::UnknownBackbone { .. }));
    }

    #[test]
    fn registry_lists_all_variants() {
        let names: Vec<_> = backbone_names().collect();
        assert_eq!(
            names,
            vec!["resnet18", "resnet34", "resnet50", "resnet101", "resnet152"]
        );
    }

    #[test]
    fn output_stride_is_eight() {
        let backbone = build_backbone("resnet18", (32, 32)).unwrap();
        assert_eq!(backbone.output_hw(), (4, 4));
        assert_eq!(backbone.feature_dim(), 512);
    }

    #[test]
    fn forward_produces_flattened_feature_map() {
        let backbone = build_backbone("resnet18", (32, 32)).unwrap();
        let input = Tensor::zeros(2, 3 * 32 * 32).unwrap();
        let out = backbone.forward(&input).unwrap();
        assert_eq!(out.shape(), (2, 512 * 4 * 4));
    }

    #[test]
    fn freeze_norms_marks_every_norm_parameter() {
        let mut backbone = build_backbone("resnet18", (32, 32)).unwrap();
        let frozen = backbone.freeze_norms();
        assert!(frozen > 0);
        backbone
            .visit_parameters(&mut |param| {
                if param.name().contains("bn") || param.name().contains("down_bn") {
                    assert!(!param.is_trainable(), "still trainable: {}", param.name());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn normalize_image_centres_each_channel() {
        let backbone = build_backbone("resnet18", (32, 32)).unwrap();
        let spatial = 32 * 32;
        let mut image = Tensor::from_fn(1, 3 * spatial, |_, c| {
            INPUT_MEAN[c / spatial]
        })
        .unwrap();
        backbone.normalize_image(&mut image).unwrap();
        for value in image.data() {
            assert!(value.abs() < 1e-6);
        }
    }

    #[test]
    fn parameter_names_are_unique() {
        use std::collections::HashSet;
        let backbone = build_backbone("resnet34", (32, 32)).unwrap();
        let mut seen = HashSet::new();
        backbone
            .visit_parameters(&mut |param| {
                assert!(seen.insert(param.name().to_string()), "{}", param.name());
                Ok(())
            })
            .unwrap();
    }
}
