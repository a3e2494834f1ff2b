// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Row-wise layer normalisation with learnable affine parameters.
///
/// Each row is centred and scaled to unit variance before `gamma` and `beta`
/// are applied. Gradients for both the affine parameters and the input follow
/// the standard closed-form LayerNorm backward.
#[derive(Debug)]
pub struct LayerNorm {
    gamma: Parameter,
    beta: Parameter,
    features: usize,
    epsilon: f32,
}

impl LayerNorm {
    /// Creates a new normaliser over `features` columns.
    pub fn new(name: impl Into<String>, features: usize, epsilon: f32) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "layer_norm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, features, vec![1.0; features])?;
        let beta = Tensor::zeros(1, features)?;
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            features,
            epsilon,
        })
    }

    /// Number of normalised columns.
    pub fn features(&self) -> usize {
        self.features
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.features {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (1, self.features),
            });
        }
        Ok(())
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (rows, cols) = input.shape();
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let offset = r * cols;
            let slice = &input.data()[offset..offset + cols];
            let mean: f32 = slice.iter().copied().sum::<f32>() / cols as f32;
            let variance: f32 = slice
                .iter()
                .map(|x| {
                    let centered = *x - mean;
                    centered * centered
                })
                .sum::<f32>()
                / cols as f32;
            let inv_denom = 1.0 / (variance + self.epsilon).sqrt();
            for c in 0..cols {
                let normed = (slice[c] - mean) * inv_denom;
                data[offset + c] = normed * gamma[c] + beta[c];
            }
        }
        Tensor::from_vec(rows, cols, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let gamma = self.gamma.value().data().to_vec();
        let mut grad_input = vec![0.0f32; rows * cols];
        let mut grad_gamma = vec![0.0f32; cols];
        let mut grad_beta = vec![0.0f32; cols];

        for r in 0..rows {
            let offset = r * cols;
            let slice = &input.data()[offset..offset + cols];
            let grad_slice = &grad_output.data()[offset..offset + cols];
            let mean: f32 = slice.iter().copied().sum::<f32>() / cols as f32;
            let variance: f32 = slice
                .iter()
                .map(|x| {
                    let centered = *x - mean;
                    centered * centered
                })
                .sum::<f32>()
                / cols as f32;
            let inv_denom = 1.0 / (variance + self.epsilon).sqrt();
            let mut normed = vec![0.0f32; cols];
            for c in 0..cols {
                normed[c] = (slice[c] - mean) * inv_denom;
                grad_gamma[c] += grad_slice[c] * normed[c];
                grad_beta[c] += grad_slice[c];
            }
            let dot_norm_grad: f32 = grad_slice
                .iter()
                .zip(normed.iter())
                .map(|(g, n)| g * n)
                .sum();
            let sum_grad: f32 = grad_slice.iter().sum();
            for c in 0..cols {
                let g = grad_slice[c];
                let n = normed[c];
                let term = (cols as f32 * g - sum_grad - n * dot_norm_grad) / cols as f32;
                grad_input[offset + c] = term * gamma[c] * inv_denom;
            }
        }

        let grad_gamma_tensor = Tensor::from_vec(1, cols, grad_gamma)?;
        let grad_beta_tensor = Tensor::from_vec(1, cols, grad_beta)?;
        self.gamma.accumulate_euclidean(&grad_gamma_tensor)?;
        self.beta.accumulate_euclidean(&grad_beta_tensor)?;

        Tensor::from_vec(rows, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}
