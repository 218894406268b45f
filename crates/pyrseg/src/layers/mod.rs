// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod dropout;
pub mod interpolate;
pub mod normalization;

pub use activation::Relu;
pub use conv::{conv_output_hw, pool_output_hw, AdaptiveAvgPool2d, Conv2d, MaxPool2d};
pub use dropout::Dropout2d;
pub use interpolate::bilinear_resize;
pub use normalization::BatchNorm2d;
