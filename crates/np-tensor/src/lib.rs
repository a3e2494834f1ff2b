// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Dense 2-D `f32` tensors for the netprobe stack.
//!
//! The meta-classifier only ever manipulates row-major matrices (query
//! batches, probe responses, parameter blocks), so the tensor type stays
//! deliberately small: validated constructors, the handful of kernels the
//! fusion network needs, and nothing speculative.

use std::fmt;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Result alias shared by every tensor-level operation.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors surfaced by tensor construction and arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    SerializationError { message: String },
    /// Learning rate must stay positive for optimizers.
    NonPositiveLearningRate { rate: f32 },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation for helpers with scalar knobs.
    InvalidValue { label: &'static str },
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
            TensorError::EmptyInput(label) => write!(f, "empty input: {label}"),
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter `{name}` in state dict")
            }
            TensorError::IoError { message } => write!(f, "i/o failure: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization failure: {message}")
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive and finite, got {rate}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value {value} for {label}")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value for {label}"),
        }
    }
}

impl std::error::Error for TensorError {}

/// Row-major dense matrix of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    fn validated(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::validated(rows, cols, vec![0.0; rows.saturating_mul(cols)])
    }

    /// Create a tensor from raw data. The provided vector must hold exactly
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::validated(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
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
        Self::validated(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// A provided `seed` makes the RNG deterministic so tests and query
    /// seeding stay reproducible; otherwise host entropy is used.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(rand::thread_rng()).map_err(|_| TensorError::InvalidValue {
                label: "random_uniform_entropy",
            })?,
        };
        let distribution = Uniform::new(min, max);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(distribution.sample(&mut rng));
        }
        Self::validated(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view over the underlying row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view over the underlying row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrow one row as a contiguous slice.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::InvalidValue { label: "row_index" });
        }
        let start = index * self.cols;
        Ok(&self.data[start..start + self.cols])
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for i in 0..self.rows {
            let lhs_row = &self.data[i * self.cols..(i + 1) * self.cols];
            let out_row = &mut out[i * other.cols..(i + 1) * other.cols];
            for (k, &lhs) in lhs_row.iter().enumerate() {
                if lhs == 0.0 {
                    continue;
                }
                let rhs_row = &other.data[k * other.cols..(k + 1) * other.cols];
                for (dst, &rhs) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *dst += lhs * rhs;
                }
            }
        }
        Self::validated(self.rows, other.cols, out)
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    fn zip_with<F>(&self, other: &Tensor, f: F) -> PureResult<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
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
            .map(|(&a, &b)| f(a, b))
            .collect();
        Self::validated(self.rows, self.cols, data)
    }

    /// Multiplies every element by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|&v| v * value).collect();
        Self::validated(self.rows, self.cols, data)
    }

    /// In-place `self += other * scale`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (dst, &src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src * scale;
        }
        Ok(())
    }

    /// Adds a bias row to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (dst, &b) in row.iter_mut().zip(bias.iter()) {
                *dst += b;
            }
        }
        Ok(())
    }

    /// Transposed copy of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
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

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if rows * cols != self.data.len() {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: self.data.len(),
            });
        }
        Self::validated(rows, cols, self.data.clone())
    }

    /// Column sums collapsed into a single vector.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (dst, &v) in sums.iter_mut().zip(row.iter()) {
                *dst += v;
            }
        }
        sums
    }

    /// Stacks tensors with identical column counts along the row axis.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut rows = 0;
        let mut data = Vec::new();
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: (tensor.rows, tensor.cols),
                    right: (rows, cols),
                });
            }
            rows += tensor.rows;
            data.extend_from_slice(&tensor.data);
        }
        Self::validated(rows, cols, data)
    }

    /// Squared Frobenius norm.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|&v| v * v).sum()
    }

    /// Arithmetic mean of every element.
    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Element-wise projection into `[min, max]`.
    ///
    /// This is the feasibility projection applied to learned query batches
    /// after each optimizer step; transient out-of-range values are expected
    /// beforehand.
    pub fn clamp_inplace(&mut self, min: f32, max: f32) -> PureResult<()> {
        if !(min <= max) || !min.is_finite() || !max.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "clamp_bounds",
            });
        }
        for value in self.data.iter_mut() {
            *value = value.clamp(min, max);
        }
        Ok(())
    }

    /// Returns `true` when every element is finite.
    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Deterministic RNG helper shared by seeding code paths.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Draws a uniform index permutation, used for corpus shuffles and splits.
pub fn permutation(len: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..=i);
        indices.swap(i, j);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_validate_shapes() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0]),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn matmul_matches_manual() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn transpose_roundtrip() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(a.transpose().transpose(), a);
    }

    #[test]
    fn add_row_broadcasts_bias() {
        let mut a = Tensor::zeros(2, 3).unwrap();
        a.add_row_inplace(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(a.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn clamp_projects_into_interval() {
        let mut a = Tensor::from_vec(1, 4, vec![-0.5, 0.25, 1.5, 0.75]).unwrap();
        a.clamp_inplace(0.0, 1.0).unwrap();
        assert_eq!(a.data(), &[0.0, 0.25, 1.0, 0.75]);
        assert!(matches!(
            a.clamp_inplace(1.0, 0.0),
            Err(TensorError::InvalidValue { .. })
        ));
    }

    #[test]
    fn random_uniform_is_seed_deterministic() {
        let a = Tensor::random_uniform(3, 4, 0.0, 1.0, Some(7)).unwrap();
        let b = Tensor::random_uniform(3, 4, 0.0, 1.0, Some(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.data().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn cat_rows_stacks_batches() {
        let a = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let stacked = Tensor::cat_rows(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), (3, 2));
        assert_eq!(stacked.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn permutation_is_a_bijection() {
        let mut rng = seeded_rng(11);
        let mut perm = permutation(16, &mut rng);
        perm.sort_unstable();
        assert_eq!(perm, (0..16).collect::<Vec<_>>());
    }
}
