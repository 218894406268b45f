// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust tensor primitives for the segmentation stack.
//!
//! Feature maps are stored row-major as `(batch, channels * height * width)`
//! with the spatial extent carried by the layers that produce them. Keeping
//! the storage two-dimensional keeps every operator a plain slice walk while
//! the layer structs own the channel/height/width bookkeeping.

use core::fmt;
use rayon::prelude::*;
use std::error::Error;

/// Result alias used throughout the crate.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensors, layers, and model wiring.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A constructor received a zero-sized shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the requested shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise panic.
    EmptyInput(&'static str),
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// Numeric guard caught a non-finite value before it could propagate.
    NonFiniteValue { label: &'static str, value: f32 },
    /// The requested backbone identifier is not in the registry.
    UnknownBackbone { name: String },
    /// Pyramid pooling requires at least one scale.
    EmptyScaleSeries,
    /// Dropout probability must lie in `[0, 1)`.
    DropoutOutOfRange { probability: f32 },
    /// A trainable parameter was not captured by any optimizer group.
    UnclassifiedParameter { name: String },
    /// A parameter landed in more than one optimizer group.
    DuplicateParameter { name: String },
    /// Attempted to load a parameter missing from a state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    SerializationError { message: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={left:?}, right={right:?} cannot be combined"
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value: {label}"),
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::UnknownBackbone { name } => {
                write!(f, "unknown base model '{name}'; expected a resnet variant")
            }
            TensorError::EmptyScaleSeries => {
                write!(f, "pyramid pooling requires a non-empty scale series")
            }
            TensorError::DropoutOutOfRange { probability } => {
                write!(f, "dropout probability must lie in [0, 1), got {probability}")
            }
            TensorError::UnclassifiedParameter { name } => {
                write!(f, "trainable parameter '{name}' missing from optimizer groups")
            }
            TensorError::DuplicateParameter { name } => {
                write!(f, "parameter '{name}' classified into more than one group")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major f32 matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Allocates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Wraps an existing buffer after validating its length.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a tensor by evaluating `f` at every `(row, col)` position.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the underlying buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Dense matrix product. Rows of the output are computed in parallel.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = Tensor::zeros(self.rows, other.cols)?;
        let inner = self.cols;
        let out_cols = other.cols;
        out.data
            .par_chunks_mut(out_cols)
            .zip(self.data.par_chunks(inner))
            .for_each(|(out_row, lhs_row)| {
                for (k, &lhs) in lhs_row.iter().enumerate() {
                    if lhs == 0.0 {
                        continue;
                    }
                    let rhs_row = &other.data[k * out_cols..(k + 1) * out_cols];
                    for (o, &rhs) in out_row.iter_mut().zip(rhs_row.iter()) {
                        *o += lhs * rhs;
                    }
                }
            });
        Ok(out)
    }

    /// Elementwise sum of two tensors of identical shape.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn zeros_rejects_zero_axis() {
        assert!(Tensor::zeros(0, 3).is_err());
        assert!(Tensor::zeros(3, 0).is_err());
    }

    #[test]
    fn matmul_matches_hand_computation() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dim() {
        let a = Tensor::zeros(2, 3).unwrap();
        let b = Tensor::zeros(2, 2).unwrap();
        assert!(a.matmul(&b).is_err());
    }

    #[test]
    fn add_requires_matching_shapes() {
        let a = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(1, 2, vec![3.0, 4.0]).unwrap();
        assert_eq!(a.add(&b).unwrap().data(), &[4.0, 6.0]);
        let c = Tensor::zeros(2, 1).unwrap();
        assert!(a.add(&c).is_err());
    }

    #[test]
    fn transpose_roundtrip() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.transpose(), a);
    }
}
