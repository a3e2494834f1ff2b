// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

mod binary_cross_entropy;

use crate::{PureResult, Tensor};

pub use binary_cross_entropy::BinaryCrossEntropyWithLogits;

/// Trait implemented by differentiable losses that operate directly on
/// netprobe tensors.
pub trait Loss {
    /// Computes the loss value for the given predictions and targets.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient of the loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}
