// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pyramid scene parsing in pure Rust.
//!
//! `pyrseg` assembles a dilated residual backbone, multi-scale context
//! pooling, and a per-pixel classifier into a dense semantic segmentation
//! model. Feature maps travel as flattened `(batch, channels * h * w)`
//! tensors; gradient computation and parameter updates are delegated to an
//! external engine, which consumes the optimizer policy exported by
//! [`optim::OptimPolicyBuilder`].

pub mod backbone;
pub mod io;
pub mod layers;
pub mod model;
pub mod module;
pub mod optim;
pub mod pyramid;
pub mod tensor;

pub use backbone::{backbone_names, build_backbone, ResNetBackbone};
pub use model::{SegmentationConfig, SegmentationModel};
pub use module::{Module, ParamKind, Parameter, TrainingMode};
pub use optim::{multipliers_for, verify_partition, OptimPolicyBuilder, ParameterGroup};
pub use pyramid::PyramidContextPool;
pub use tensor::{PureResult, Tensor, TensorError};
