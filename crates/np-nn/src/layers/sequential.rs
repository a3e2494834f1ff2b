// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor};

/// Ordered chain of boxed modules. Candidate probe stacks are built from
/// this container.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer to the end of the chain.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Number of layers in the chain.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// One forward pass that keeps the input each layer saw, so the
    /// backward pass can replay the chain in reverse.
    fn trace(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut seen = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            let next = layer.forward(&current)?;
            seen.push(current);
            current = next;
        }
        Ok(seen)
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.layers
            .iter()
            .try_fold(input.clone(), |activation, layer| layer.forward(&activation))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let inputs = self.trace(input)?;
        let mut grad = grad_output.clone();
        for (layer, layer_input) in self.layers.iter_mut().zip(inputs.iter()).rev() {
            grad = layer.backward(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::layers::Relu;

    #[test]
    fn sequential_forward_and_backward() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 3).unwrap());
        seq.push(Relu::new());
        seq.push(Linear::new("l2", 3, 1).unwrap());

        let input = Tensor::from_vec(1, 2, vec![0.5, -0.1]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![0.2]).unwrap();
        let output = seq.forward(&input).unwrap();
        let grad_out = output.sub(&target).unwrap();
        let grad_in = seq.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (1, 2));
        seq.apply_step(0.05).unwrap();
        let new_output = seq.forward(&input).unwrap();
        assert_ne!(output, new_output);
    }

    #[test]
    fn backward_matches_manual_two_layer_replay() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("a", 2, 2).unwrap());
        seq.push(Linear::new("b", 2, 1).unwrap());

        let mut first = Linear::new("a", 2, 2).unwrap();
        let mut second = Linear::new("b", 2, 1).unwrap();

        let input = Tensor::from_vec(1, 2, vec![0.4, -0.6]).unwrap();
        let grad_out = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let chained = seq.backward(&input, &grad_out).unwrap();

        let hidden = first.forward(&input).unwrap();
        let grad_hidden = second.backward(&hidden, &grad_out).unwrap();
        let manual = first.backward(&input, &grad_hidden).unwrap();
        assert_eq!(chained, manual);
    }

    #[test]
    fn empty_sequential_is_the_identity() {
        let mut seq = Sequential::new();
        let input = Tensor::from_vec(1, 3, vec![0.1, 0.2, 0.3]).unwrap();
        assert_eq!(seq.forward(&input).unwrap(), input);
        let grad = Tensor::from_vec(1, 3, vec![1.0, -1.0, 0.5]).unwrap();
        assert_eq!(seq.backward(&input, &grad).unwrap(), grad);
    }

    #[test]
    fn sequential_state_dict_round_trip() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 2).unwrap());
        let state = seq.state_dict().unwrap();
        assert!(state.contains_key("l1::weight"));
        assert!(state.contains_key("l1::bias"));

        let mut other = Sequential::new();
        other.push(Linear::new("l1", 2, 2).unwrap());
        other.load_state_dict(&state).unwrap();
        let input = Tensor::from_vec(1, 2, vec![0.3, 0.7]).unwrap();
        assert_eq!(seq.forward(&input).unwrap(), other.forward(&input).unwrap());
    }
}
