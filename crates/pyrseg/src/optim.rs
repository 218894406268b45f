// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Optimizer grouping policy for fine-tuning on top of a pretrained
//! backbone.
//!
//! Newly attached layers learn faster than the pretrained base, and biases
//! and normalisation parameters skip weight decay. Groups reference
//! parameters by canonical name so the external optimizer can resolve them
//! against the model's state dict.

use crate::model::SegmentationModel;
use crate::module::{Module, ParamKind};
use crate::tensor::{PureResult, TensorError};
use std::collections::HashSet;

/// A named set of parameters sharing learning-rate and decay multipliers.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterGroup {
    name: &'static str,
    lr_mult: f32,
    decay_mult: f32,
    parameters: Vec<String>,
}

impl ParameterGroup {
    fn new(name: &'static str, lr_mult: f32, decay_mult: f32) -> Self {
        Self {
            name,
            lr_mult,
            decay_mult,
            parameters: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lr_mult(&self) -> f32 {
        self.lr_mult
    }

    pub fn decay_mult(&self) -> f32 {
        self.decay_mult
    }

    /// Canonical parameter names belonging to this group.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// Partitions a model's trainable parameters into optimizer groups.
#[derive(Debug)]
pub struct OptimPolicyBuilder {
    base_prefix: String,
}

impl OptimPolicyBuilder {
    /// Prepares a builder that treats the model's backbone parameters as
    /// the pretrained base and everything else as newly attached.
    pub fn for_model(model: &SegmentationModel) -> Self {
        Self {
            base_prefix: model.base_prefix(),
        }
    }

    /// Builds the six fixed groups. Frozen parameters are skipped; every
    /// trainable parameter lands in exactly one group.
    pub fn build(&self, model: &SegmentationModel) -> PureResult<Vec<ParameterGroup>> {
        let mut additional_weight = ParameterGroup::new("additional_weight", 10.0, 1.0);
        let mut additional_bias = ParameterGroup::new("additional_bias", 20.0, 1.0);
        let mut additional_norm = ParameterGroup::new("additional_norm", 10.0, 0.0);
        let mut base_weight = ParameterGroup::new("base_weight", 1.0, 1.0);
        let mut base_bias = ParameterGroup::new("base_bias", 2.0, 0.0);
        let mut base_norm = ParameterGroup::new("base_norm", 1.0, 0.0);
        let mut seen = HashSet::new();
        model.visit_parameters(&mut |param| {
            if !param.is_trainable() {
                return Ok(());
            }
            if !seen.insert(param.name().to_string()) {
                return Err(TensorError::DuplicateParameter {
                    name: param.name().to_string(),
                });
            }
            let base = param.name().starts_with(&self.base_prefix);
            let group = match (base, param.kind()) {
                (false, ParamKind::ConvWeight) => &mut additional_weight,
                (false, ParamKind::ConvBias) => &mut additional_bias,
                (false, ParamKind::NormScaleShift) => &mut additional_norm,
                (true, ParamKind::ConvWeight) => &mut base_weight,
                (true, ParamKind::ConvBias) => &mut base_bias,
                (true, ParamKind::NormScaleShift) => &mut base_norm,
            };
            group.parameters.push(param.name().to_string());
            Ok(())
        })?;
        Ok(vec![
            additional_weight,
            additional_bias,
            additional_norm,
            base_weight,
            base_bias,
            base_norm,
        ])
    }
}

/// Resolves a parameter name to its `(lr_mult, decay_mult)` pair, for an
/// external optimizer walking the state dict.
pub fn multipliers_for(groups: &[ParameterGroup], name: &str) -> Option<(f32, f32)> {
    groups
        .iter()
        .find(|group| group.parameters.iter().any(|p| p == name))
        .map(|group| (group.lr_mult, group.decay_mult))
}

/// Checks that every trainable parameter of the model appears in exactly
/// one of the provided groups.
pub fn verify_partition(
    model: &SegmentationModel,
    groups: &[ParameterGroup],
) -> PureResult<()> {
    let mut membership = HashSet::new();
    for group in groups {
        for name in group.parameters() {
            if !membership.insert(name.as_str()) {
                return Err(TensorError::DuplicateParameter { name: name.clone() });
            }
        }
    }
    model.visit_parameters(&mut |param| {
        if param.is_trainable() && !membership.contains(param.name()) {
            return Err(TensorError::UnclassifiedParameter {
                name: param.name().to_string(),
            });
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegmentationConfig;
    use crate::module::TrainingMode;

    fn small_model() -> SegmentationModel {
        let config = SegmentationConfig::new(5, (32, 32))
            .with_base_model("resnet18")
            .with_scale_series(vec![1, 2]);
        SegmentationModel::new(&config).unwrap()
    }

    #[test]
    fn groups_carry_fixed_multipliers() {
        let model = small_model();
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        let table: Vec<_> = groups
            .iter()
            .map(|g| (g.name(), g.lr_mult(), g.decay_mult()))
            .collect();
        assert_eq!(
            table,
            vec![
                ("additional_weight", 10.0, 1.0),
                ("additional_bias", 20.0, 1.0),
                ("additional_norm", 10.0, 0.0),
                ("base_weight", 1.0, 1.0),
                ("base_bias", 2.0, 0.0),
                ("base_norm", 1.0, 0.0),
            ]
        );
    }

    #[test]
    fn every_trainable_parameter_is_partitioned() {
        let model = small_model();
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        verify_partition(&model, &groups).unwrap();
        let mut trainable = 0usize;
        model
            .visit_parameters(&mut |param| {
                if param.is_trainable() {
                    trainable += 1;
                }
                Ok(())
            })
            .unwrap();
        let grouped: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(grouped, trainable);
    }

    #[test]
    fn classifier_lands_in_additional_groups() {
        let model = small_model();
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        let weights = &groups[0];
        let biases = &groups[1];
        assert!(weights
            .parameters()
            .iter()
            .any(|name| name == "classifier::weight"));
        assert!(biases
            .parameters()
            .iter()
            .any(|name| name == "classifier::bias"));
    }

    #[test]
    fn backbone_parameters_land_in_base_groups() {
        let model = small_model();
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        let prefix = model.base_prefix();
        for group in &groups[3..] {
            assert!(group.parameters().iter().all(|n| n.starts_with(&prefix)));
            assert!(!group.is_empty());
        }
        for group in &groups[..3] {
            assert!(group.parameters().iter().all(|n| !n.starts_with(&prefix)));
        }
    }

    #[test]
    fn frozen_norms_are_excluded_from_groups() {
        let config = SegmentationConfig::new(5, (32, 32))
            .with_base_model("resnet18")
            .with_scale_series(vec![1, 2])
            .with_partial_freeze(true);
        let mut model = SegmentationModel::new(&config).unwrap();
        model.set_mode(TrainingMode::Train);
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        let base_norm = groups.iter().find(|g| g.name() == "base_norm").unwrap();
        assert!(base_norm.is_empty());
        verify_partition(&model, &groups).unwrap();
    }

    #[test]
    fn multipliers_resolve_by_name() {
        let model = small_model();
        let groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        assert_eq!(
            multipliers_for(&groups, "classifier::weight"),
            Some((10.0, 1.0))
        );
        assert_eq!(
            multipliers_for(&groups, "classifier::bias"),
            Some((20.0, 1.0))
        );
        assert_eq!(multipliers_for(&groups, "nonexistent::weight"), None);
    }

    #[test]
    fn verify_partition_catches_missing_parameter() {
        let model = small_model();
        let mut groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        groups[0].parameters.pop();
        let err = verify_partition(&model, &groups).unwrap_err();
        assert!(matches!(err, TensorError::UnclassifiedParameter { .. }));
    }

    #[test]
    fn verify_partition_catches_duplicates() {
        let model = small_model();
        let mut groups = OptimPolicyBuilder::for_model(&model).build(&model).unwrap();
        let stolen = groups[3].parameters[0].clone();
        groups[0].parameters.push(stolen);
        let err = verify_partition(&model, &groups).unwrap_err();
        assert!(matches!(err, TensorError::DuplicateParameter { .. }));
    }
}
