// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scene-parsing model: dilated backbone, pyramid context pooling, and a
//! per-pixel classifier restored to the input resolution.

use crate::backbone::{build_backbone, ResNetBackbone};
use crate::layers::{bilinear_resize, Conv2d, Dropout2d};
use crate::module::{Module, Parameter, TrainingMode};
use crate::pyramid::PyramidContextPool;
use crate::tensor::{PureResult, Tensor, TensorError};
use tracing::{debug, info};

/// Construction parameters for [`SegmentationModel`].
#[derive(Clone, Debug)]
pub struct SegmentationConfig {
    pub num_classes: usize,
    pub base_model: String,
    pub dropout: f32,
    pub partial_freeze: bool,
    pub scale_series: Vec<usize>,
    pub input_hw: (usize, usize),
}

impl SegmentationConfig {
    /// Defaults matching the reference training recipe.
    pub fn new(num_classes: usize, input_hw: (usize, usize)) -> Self {
        Self {
            num_classes,
            base_model: "resnet101".to_string(),
            dropout: 0.1,
            partial_freeze: false,
            scale_series: vec![10, 20, 30, 60],
            input_hw,
        }
    }

    pub fn with_base_model(mut self, base_model: impl Into<String>) -> Self {
        self.base_model = base_model.into();
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_partial_freeze(mut self, enable: bool) -> Self {
        self.partial_freeze = enable;
        self
    }

    pub fn with_scale_series(mut self, scales: Vec<usize>) -> Self {
        self.scale_series = scales;
        self
    }
}

/// Dense semantic segmentation model.
///
/// The model owns an explicit [`TrainingMode`] and re-applies it to every
/// stateful layer on each transition. When the partial-freeze flag is set,
/// every transition into [`TrainingMode::Train`] pins the backbone
/// normalisation layers to their running statistics and marks their affine
/// parameters non-trainable. Enabling the flag mid-session only affects
/// future transitions.
#[derive(Debug)]
pub struct SegmentationModel {
    backbone: ResNetBackbone,
    pyramid: PyramidContextPool,
    dropout: Dropout2d,
    classifier: Conv2d,
    num_classes: usize,
    input_hw: (usize, usize),
    mode: TrainingMode,
    partial_freeze: bool,
}

impl SegmentationModel {
    /// Builds the model in evaluation mode.
    pub fn new(config: &SegmentationConfig) -> PureResult<Self> {
        if config.num_classes == 0 {
            return Err(TensorError::InvalidValue {
                label: "num_classes",
            });
        }
        let backbone = build_backbone(&config.base_model, config.input_hw)?;
        let feature_hw = backbone.output_hw();
        let pyramid = PyramidContextPool::new(
            "pyramid",
            backbone.feature_dim(),
            feature_hw,
            &config.scale_series,
        )?;
        let dropout = Dropout2d::new(config.dropout, pyramid.feature_dim())?;
        let classifier = Conv2d::new(
            "classifier",
            pyramid.feature_dim(),
            config.num_classes,
            (1, 1),
            (1, 1),
            (0, 0),
            (1, 1),
            feature_hw,
        )?;
        Ok(Self {
            backbone,
            pyramid,
            dropout,
            classifier,
            num_classes: config.num_classes,
            input_hw: config.input_hw,
            mode: TrainingMode::Eval,
            partial_freeze: config.partial_freeze,
        })
    }

    /// Builds the model with a seeded dropout RNG, for reproducible runs.
    pub fn with_seed(config: &SegmentationConfig, seed: u64) -> PureResult<Self> {
        let mut model = Self::new(config)?;
        model.dropout =
            Dropout2d::with_seed(config.dropout, model.pyramid.feature_dim(), Some(seed))?;
        Ok(model)
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Expected spatial extent of the input image.
    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Current training mode.
    pub fn mode(&self) -> TrainingMode {
        self.mode
    }

    /// Whether the next transition into training will freeze the backbone
    /// normalisation layers.
    pub fn partial_freeze(&self) -> bool {
        self.partial_freeze
    }

    /// Canonical name prefix of the pretrained backbone's parameters.
    pub fn base_prefix(&self) -> String {
        format!("{}::", self.backbone.name())
    }

    /// Enables or disables the partial freeze policy for future mode
    /// transitions. The current mode is left untouched.
    pub fn set_partial_freeze(&mut self, enable: bool) {
        self.partial_freeze = enable;
    }

    /// Applies a training mode to every stateful layer. The pass is
    /// deterministic: the same mode and flags always produce the same layer
    /// states, regardless of the previous mode.
    pub fn set_mode(&mut self, mode: TrainingMode) {
        debug!(?mode, partial_freeze = self.partial_freeze, "mode transition");
        self.mode = mode;
        self.backbone.set_mode(mode);
        self.pyramid.set_mode(mode);
        self.dropout.set_mode(mode);
        if mode.is_train() && self.partial_freeze {
            let frozen = self.backbone.freeze_norms();
            info!(layers = frozen, "freezing backbone batch norm layers");
        }
    }
}

impl Module for SegmentationModel {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (h, w) = self.input_hw;
        if cols != 3 * h * w {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, 3 * h * w),
            });
        }
        let features = self.backbone.forward(input)?;
        let context = self.pyramid.forward(&features)?;
        let regularised = self.dropout.forward(&context)?;
        let logits = self.classifier.forward(&regularised)?;
        bilinear_resize(
            &logits,
            self.num_classes,
            self.backbone.output_hw(),
            self.input_hw,
        )
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.backbone.visit_parameters(visitor)?;
        self.pyramid.visit_parameters(visitor)?;
        self.classifier.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.backbone.visit_parameters_mut(visitor)?;
        self.pyramid.visit_parameters_mut(visitor)?;
        self.classifier.visit_parameters_mut(visitor)
    }
}
