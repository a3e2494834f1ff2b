// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::error::{DetectError, DetectResult};
use np_nn::io::StoredTensor;
use np_nn::{Linear, Module, PureResult, Relu, Sequential, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk form of a candidate checkpoint: architecture descriptor plus a
/// state dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCandidate {
    input_width: usize,
    hidden_widths: Vec<usize>,
    num_classes: usize,
    parameters: HashMap<String, StoredTensor>,
}

/// Frozen differentiable classifier loaded from a `model.bin` checkpoint.
///
/// The model is probed forward with a query batch and can route gradients
/// back to its inputs, but its own parameters are never handed to any
/// optimizer: the accumulators written by `backward_input` are discarded
/// together with the object after one example.
pub struct CandidateModel {
    input_width: usize,
    hidden_widths: Vec<usize>,
    num_classes: usize,
    stack: Sequential,
}

impl core::fmt::Debug for CandidateModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "CandidateModel(input={},hidden={:?},classes={})",
            self.input_width, self.hidden_widths, self.num_classes
        )
    }
}

fn build_stack(
    input_width: usize,
    hidden_widths: &[usize],
    num_classes: usize,
) -> PureResult<Sequential> {
    let mut stack = Sequential::new();
    let mut width = input_width;
    for (i, &hidden) in hidden_widths.iter().enumerate() {
        stack.push(Linear::new(format!("candidate::l{i}"), width, hidden)?);
        stack.push(Relu::new());
        width = hidden;
    }
    stack.push(Linear::new(
        format!("candidate::l{}", hidden_widths.len()),
        width,
        num_classes,
    )?);
    Ok(stack)
}

impl CandidateModel {
    /// Builds a freshly initialized classifier over flattened inputs. Used by
    /// zoo synthesis and test fixtures; real candidates arrive via [`load`].
    ///
    /// [`load`]: CandidateModel::load
    pub fn new(
        input_width: usize,
        hidden_widths: &[usize],
        num_classes: usize,
    ) -> DetectResult<Self> {
        if input_width == 0 || num_classes == 0 {
            return Err(DetectError::Metadata(format!(
                "degenerate candidate shape {input_width}->{num_classes}"
            )));
        }
        let stack = build_stack(input_width, hidden_widths, num_classes)?;
        Ok(Self {
            input_width,
            hidden_widths: hidden_widths.to_vec(),
            num_classes,
            stack,
        })
    }

    /// Width of the flattened input the model expects.
    pub fn input_width(&self) -> usize {
        self.input_width
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Probes the frozen model: `[num_queries, input_width]` in,
    /// `[num_queries, num_classes]` out.
    pub fn forward(&self, queries: &Tensor) -> DetectResult<Tensor> {
        Ok(self.stack.forward(queries)?)
    }

    /// Routes a response-space gradient back to the probe inputs through the
    /// frozen forward graph. The stack's own parameter accumulators are
    /// written as a side effect but never stepped.
    pub fn backward_input(
        &mut self,
        queries: &Tensor,
        grad_responses: &Tensor,
    ) -> DetectResult<Tensor> {
        Ok(self.stack.backward(queries, grad_responses)?)
    }

    /// Clears the parameter accumulators left behind by `backward_input`.
    pub fn zero_accumulators(&mut self) -> DetectResult<()> {
        Ok(self.stack.zero_accumulators()?)
    }

    /// Perturbs every parameter with seeded uniform noise. Zoo synthesis uses
    /// this to make checkpoints of the same architecture distinguishable.
    pub fn jitter_parameters(&mut self, magnitude: f32, seed: u64) -> DetectResult<()> {
        let mut counter = 0u64;
        self.stack.visit_parameters_mut(&mut |param| {
            let (rows, cols) = param.value().shape();
            let noise = Tensor::random_uniform(
                rows,
                cols,
                -magnitude,
                magnitude,
                Some(seed.wrapping_add(counter)),
            )?;
            counter += 1;
            param.value_mut().add_scaled(&noise, 1.0)
        })?;
        Ok(())
    }

    /// Serializes the architecture descriptor and state dict as bincode.
    pub fn save(&self, path: impl AsRef<Path>) -> DetectResult<()> {
        let path = path.as_ref();
        let mut parameters = HashMap::new();
        for (name, tensor) in self.stack.state_dict()? {
            parameters.insert(name, StoredTensor::from_tensor(&tensor));
        }
        let stored = StoredCandidate {
            input_width: self.input_width,
            hidden_widths: self.hidden_widths.clone(),
            num_classes: self.num_classes,
            parameters,
        };
        let file = File::create(path).map_err(|err| DetectError::resource(path, err))?;
        bincode::serialize_into(BufWriter::new(file), &stored)
            .map_err(|err| DetectError::Serialization(err.to_string()))?;
        Ok(())
    }

    /// Deserializes a checkpoint written by [`save`].
    ///
    /// [`save`]: CandidateModel::save
    pub fn load(path: impl AsRef<Path>) -> DetectResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| DetectError::resource(path, err))?;
        let stored: StoredCandidate = bincode::deserialize_from(BufReader::new(file))
            .map_err(|err| DetectError::Serialization(err.to_string()))?;

        let mut state = HashMap::new();
        for (name, tensor) in stored.parameters {
            state.insert(name, tensor.into_tensor()?);
        }
        let mut model =
            CandidateModel::new(stored.input_width, &stored.hidden_widths, stored.num_classes)?;
        model.stack.load_state_dict(&state)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn forward_produces_class_scores() {
        let model = CandidateModel::new(12, &[8], 4).unwrap();
        let queries = Tensor::random_uniform(5, 12, 0.0, 1.0, Some(3)).unwrap();
        let responses = model.forward(&queries).unwrap();
        assert_eq!(responses.shape(), (5, 4));
        assert!(responses.all_finite());
    }

    #[test]
    fn backward_input_returns_query_gradient() {
        let mut model = CandidateModel::new(6, &[4], 2).unwrap();
        let queries = Tensor::random_uniform(3, 6, 0.0, 1.0, Some(9)).unwrap();
        let grad = Tensor::from_vec(3, 2, vec![1.0; 6]).unwrap();
        let grad_queries = model.backward_input(&queries, &grad).unwrap();
        assert_eq!(grad_queries.shape(), (3, 6));
        model.zero_accumulators().unwrap();
    }

    #[test]
    fn save_load_round_trip_preserves_behavior() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = CandidateModel::new(10, &[6, 5], 3).unwrap();
        model.save(&path).unwrap();
        let restored = CandidateModel::load(&path).unwrap();

        let queries = Tensor::random_uniform(4, 10, 0.0, 1.0, Some(1)).unwrap();
        assert_eq!(
            model.forward(&queries).unwrap(),
            restored.forward(&queries).unwrap()
        );
    }

    #[test]
    fn jitter_changes_outputs() {
        let mut model = CandidateModel::new(8, &[4], 2).unwrap();
        let queries = Tensor::random_uniform(2, 8, 0.0, 1.0, Some(5)).unwrap();
        let before = model.forward(&queries).unwrap();
        model.jitter_parameters(0.5, 77).unwrap();
        assert_ne!(before, model.forward(&queries).unwrap());
    }

    #[test]
    fn load_missing_checkpoint_is_resource_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.bin");
        assert!(matches!(
            CandidateModel::load(&missing),
            Err(DetectError::Resource { .. })
        ));
    }
}
