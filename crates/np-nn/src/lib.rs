// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! `nn.Module`-style building blocks for the netprobe meta-classifier.
//!
//! Every layer exposes an explicit forward/backward pair and enumerates its
//! parameters through visitors, which keeps the trainable surface fully
//! auditable: an optimizer only ever touches parameters that were explicitly
//! handed to it.

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use layers::linear::Linear;
pub use layers::normalization::LayerNorm;
pub use layers::sequential::Sequential;
pub use layers::Relu;
pub use loss::{BinaryCrossEntropyWithLogits, Loss};
pub use module::{Module, Parameter};
pub use optim::{AdamOptimizer, LrScheduler, StepDecayScheduler};

pub use np_tensor::{PureResult, Tensor, TensorError};
