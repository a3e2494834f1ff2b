// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use super::Loss;
use crate::{PureResult, Tensor};
use np_tensor::TensorError;

/// Binary cross-entropy computed on raw logits.
///
/// The forward pass uses the log-sum-exp formulation
/// `max(x, 0) - x * z + ln(1 + exp(-|x|))`, which stays finite for any logit
/// magnitude. The backward pass is `sigmoid(x) - z`, averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCrossEntropyWithLogits;

impl BinaryCrossEntropyWithLogits {
    /// Creates a new loss instance.
    pub fn new() -> Self {
        Self
    }

    fn guard(&self, prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(TensorError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        if prediction.is_empty() {
            return Err(TensorError::EmptyInput("bce_with_logits"));
        }
        Ok(())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Loss for BinaryCrossEntropyWithLogits {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        self.guard(prediction, target)?;
        let mut sum = 0.0f32;
        for (logit, label) in prediction.data().iter().zip(target.data().iter()) {
            sum += logit.max(0.0) - logit * label + (-logit.abs()).exp().ln_1p();
        }
        Tensor::from_vec(1, 1, vec![sum / prediction.len() as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        self.guard(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let inv = 1.0 / prediction.len() as f32;
        let mut data = Vec::with_capacity(rows * cols);
        for (logit, label) in prediction.data().iter().zip(target.data().iter()) {
            data.push((sigmoid(*logit) - label) * inv);
        }
        Tensor::from_vec(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bce_matches_reference_values() {
        let mut loss = BinaryCrossEntropyWithLogits::new();
        let prediction = Tensor::from_vec(1, 2, vec![0.0, 0.0]).unwrap();
        let target = Tensor::from_vec(1, 2, vec![1.0, 0.0]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        // -ln(0.5) for both entries
        assert!((value.data()[0] - 0.6931472).abs() < 1e-6);
    }

    #[test]
    fn bce_stays_finite_for_extreme_logits() {
        let mut loss = BinaryCrossEntropyWithLogits::new();
        let prediction = Tensor::from_vec(1, 2, vec![100.0, -100.0]).unwrap();
        let target = Tensor::from_vec(1, 2, vec![0.0, 1.0]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!(value.data()[0].is_finite());
        assert!(value.data()[0] > 10.0);

        let grad = loss.backward(&prediction, &target).unwrap();
        assert!(grad.all_finite());
    }

    #[test]
    fn bce_gradient_sign_tracks_labels() {
        let mut loss = BinaryCrossEntropyWithLogits::new();
        let prediction = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        let target = Tensor::from_vec(1, 2, vec![1.0, 0.0]).unwrap();
        let grad = loss.backward(&prediction, &target).unwrap();
        assert!(grad.data()[0] < 0.0);
        assert!(grad.data()[1] > 0.0);
    }
}
