// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Structural role a parameter plays inside its layer. The optimizer policy
/// partitions parameters by this tag instead of inspecting layer types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Convolution kernel.
    ConvWeight,
    /// Convolution bias vector.
    ConvBias,
    /// Normalization scale or shift (gamma/beta).
    NormScaleShift,
}

/// Explicit training/evaluation mode consulted by stateful layers. Mode
/// transitions are applied by the owning model as a single deterministic
/// pass rather than by overriding a base setter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingMode {
    Train,
    Eval,
}

impl TrainingMode {
    /// Whether the mode enables stochastic layers and batch statistics.
    pub fn is_train(self) -> bool {
        matches!(self, TrainingMode::Train)
    }
}

/// Trainable tensor with a canonical name and a structural role tag.
///
/// Gradient computation is delegated to the external compute engine; the
/// parameter only tracks whether that engine is allowed to update it.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    value: Tensor,
    kind: ParamKind,
    trainable: bool,
}

impl Parameter {
    /// Creates a trainable parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            trainable: true,
        }
    }

    /// Canonical identifier assigned at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural role of the parameter.
    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Immutable view of the underlying tensor.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Mutable view of the underlying tensor.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Whether the external optimizer may update this parameter.
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Marks the parameter as frozen or trainable.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Replaces the parameter value with a shape-checked tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if self.value.shape() != value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: value.shape(),
            });
        }
        self.value = value.clone();
        Ok(())
    }
}

/// Forward-only module trait in the `nn.Module` style.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dict produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_starts_trainable_and_can_freeze() {
        let value = Tensor::zeros(1, 4).unwrap();
        let mut param = Parameter::new("bn::gamma", value, ParamKind::NormScaleShift);
        assert!(param.is_trainable());
        param.set_trainable(false);
        assert!(!param.is_trainable());
        assert_eq!(param.kind(), ParamKind::NormScaleShift);
    }

    #[test]
    fn load_value_rejects_shape_change() {
        let mut param = Parameter::new(
            "conv::weight",
            Tensor::zeros(2, 2).unwrap(),
            ParamKind::ConvWeight,
        );
        let err = param.load_value(&Tensor::zeros(1, 4).unwrap()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }
}
