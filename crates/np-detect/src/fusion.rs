// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! The fusion network mapping probe responses plus the mask-distance
//! feature to a single trojan logit.
//!
//! Architecture, per supported family: an affine projection
//! `num_classes * num_queries -> 1024` followed by layer normalisation. The
//! distance vector is concatenated onto the normalised embedding, ReLU is
//! applied to the concatenation, and a fixed decreasing trunk
//! `1032 -> 512 -> 256 -> 128 -> 64 -> 32 -> 16 -> 1` produces the logit.
//! No sigmoid is applied internally; callers interpret the logit through a
//! logits-based loss or the zero-threshold decision rule.

use crate::candidate::CandidateModel;
use crate::error::{DetectError, DetectResult};
use crate::family::{DatasetFamily, FamilyTable, SUPPORTED_FAMILIES};
use np_nn::{LayerNorm, Linear, Module, Parameter, PureResult, Relu, Tensor, TensorError};
use std::collections::HashMap;

/// Width of the per-family embedding after the affine projection.
pub const EMBED_WIDTH: usize = 1024;

const TRUNK_WIDTHS: [usize; 7] = [512, 256, 128, 64, 32, 16, 1];

/// Intermediate activations captured by a traced forward pass, consumed by
/// [`FusionNetwork::backward`].
pub struct FusionTrace {
    flat: Tensor,
    affine_out: Tensor,
    concat: Tensor,
    trunk_inputs: Vec<Tensor>,
    trunk_pre: Vec<Tensor>,
    logit: f32,
}

impl FusionTrace {
    /// The scalar trojan logit.
    pub fn logit(&self) -> f32 {
        self.logit
    }
}

/// Meta-classifier head over probe responses and mask distances.
pub struct FusionNetwork {
    num_queries: usize,
    distance_width: usize,
    affines: Vec<(DatasetFamily, Linear)>,
    norm: LayerNorm,
    trunk: Vec<Linear>,
    relu: Relu,
}

impl core::fmt::Debug for FusionNetwork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FusionNetwork(num_queries={},distance_width={},families={})",
            self.num_queries,
            self.distance_width,
            self.affines.len()
        )
    }
}

impl FusionNetwork {
    /// Builds the network for the closed supported-family set.
    /// `distance_width` is `2 * |orders|` for the configured order set.
    pub fn new(
        num_queries: usize,
        distance_width: usize,
        table: &FamilyTable,
    ) -> DetectResult<Self> {
        if num_queries == 0 || distance_width == 0 {
            return Err(DetectError::Config(
                "fusion network needs non-zero query and distance widths".into(),
            ));
        }
        let mut affines = Vec::with_capacity(SUPPORTED_FAMILIES.len());
        for family in SUPPORTED_FAMILIES {
            let input = table.profile(family).num_classes * num_queries;
            let layer = Linear::new(format!("fusion::affine::{}", family.token()), input, EMBED_WIDTH)?;
            affines.push((family, layer));
        }
        let norm = LayerNorm::new("fusion::norm", EMBED_WIDTH, 1e-5)?;
        let mut trunk = Vec::with_capacity(TRUNK_WIDTHS.len());
        let mut width = EMBED_WIDTH + distance_width;
        for (i, &out) in TRUNK_WIDTHS.iter().enumerate() {
            trunk.push(Linear::new(format!("fusion::layer{}", i + 1), width, out)?);
            width = out;
        }
        Ok(Self {
            num_queries,
            distance_width,
            affines,
            norm,
            trunk,
            relu: Relu::new(),
        })
    }

    /// Queries per probe batch, fixed at construction.
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    fn affine(&self, family: DatasetFamily) -> DetectResult<&Linear> {
        self.affines
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, l)| l)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))
    }

    fn affine_mut(&mut self, family: DatasetFamily) -> DetectResult<&mut Linear> {
        self.affines
            .iter_mut()
            .find(|(f, _)| *f == family)
            .map(|(_, l)| l)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))
    }

    /// Runs the full forward pass, keeping every intermediate activation so
    /// a later [`backward`] call can replay the graph.
    ///
    /// [`backward`]: FusionNetwork::backward
    pub fn forward_traced(
        &self,
        candidate: &CandidateModel,
        family: DatasetFamily,
        queries: &Tensor,
        distances: &Tensor,
    ) -> DetectResult<FusionTrace> {
        let affine = self.affine(family)?;
        if distances.shape() != (1, self.distance_width) {
            return Err(DetectError::Tensor(TensorError::ShapeMismatch {
                left: distances.shape(),
                right: (1, self.distance_width),
            }));
        }

        let responses = candidate.forward(queries)?;
        let (rows, cols) = responses.shape();
        if rows * cols != affine.input_dim() {
            return Err(DetectError::Metadata(format!(
                "candidate produced {rows}x{cols} responses for {family}, expected {} total",
                affine.input_dim()
            )));
        }
        let flat = responses.reshape(1, rows * cols)?;
        let affine_out = affine.forward(&flat)?;
        let norm_out = self.norm.forward(&affine_out)?;

        let mut concat_data = norm_out.data().to_vec();
        concat_data.extend_from_slice(distances.data());
        let concat = Tensor::from_vec(1, EMBED_WIDTH + self.distance_width, concat_data)?;

        let mut trunk_inputs = Vec::with_capacity(self.trunk.len());
        let mut trunk_pre = Vec::with_capacity(self.trunk.len() - 1);
        let mut hidden = self.relu.forward(&concat)?;
        for layer in &self.trunk[..self.trunk.len() - 1] {
            trunk_inputs.push(hidden.clone());
            let pre = layer.forward(&hidden)?;
            hidden = self.relu.forward(&pre)?;
            trunk_pre.push(pre);
        }
        trunk_inputs.push(hidden.clone());
        let out = self.trunk[self.trunk.len() - 1].forward(&hidden)?;
        let logit = out.data()[0];

        Ok(FusionTrace {
            flat,
            affine_out,
            concat,
            trunk_inputs,
            trunk_pre,
            logit,
        })
    }

    /// Forward pass returning only the logit. Deterministic given fixed
    /// parameters and inputs.
    pub fn score(
        &self,
        candidate: &CandidateModel,
        family: DatasetFamily,
        queries: &Tensor,
        distances: &Tensor,
    ) -> DetectResult<f32> {
        Ok(self
            .forward_traced(candidate, family, queries, distances)?
            .logit())
    }

    /// Pushes `grad_logit` back through the trunk, the normalisation, the
    /// family affine, and the frozen candidate. Fusion parameter
    /// accumulators are populated in place; the returned tensor is the
    /// gradient with respect to the query batch. The distance feature is a
    /// leaf input, so its gradient block is dropped.
    pub fn backward(
        &mut self,
        candidate: &mut CandidateModel,
        family: DatasetFamily,
        queries: &Tensor,
        trace: &FusionTrace,
        grad_logit: f32,
    ) -> DetectResult<Tensor> {
        let last = self.trunk.len() - 1;
        let mut grad = Tensor::from_vec(1, 1, vec![grad_logit])?;
        grad = self.trunk[last].backward(&trace.trunk_inputs[last], &grad)?;
        for i in (0..last).rev() {
            grad = self.relu.backward(&trace.trunk_pre[i], &grad)?;
            grad = self.trunk[i].backward(&trace.trunk_inputs[i], &grad)?;
        }
        grad = self.relu.backward(&trace.concat, &grad)?;

        let grad_norm_out = Tensor::from_vec(1, EMBED_WIDTH, grad.data()[..EMBED_WIDTH].to_vec())?;
        let grad_affine_out = self.norm.backward(&trace.affine_out, &grad_norm_out)?;
        let grad_flat = self.affine_mut(family)?.backward(&trace.flat, &grad_affine_out)?;

        let cols = grad_flat.len() / self.num_queries;
        let grad_responses = grad_flat.reshape(self.num_queries, cols)?;
        candidate.backward_input(queries, &grad_responses)
    }

    /// Visits every fusion parameter mutably: affines first (canonical
    /// family order), then the norm, then the trunk.
    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (_, layer) in &mut self.affines {
            layer.visit_parameters_mut(visitor)?;
        }
        self.norm.visit_parameters_mut(visitor)?;
        for layer in &mut self.trunk {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    /// Visits every fusion parameter immutably, same order as the mutable
    /// visitor.
    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (_, layer) in &self.affines {
            layer.visit_parameters(visitor)?;
        }
        self.norm.visit_parameters(visitor)?;
        for layer in &self.trunk {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    /// Captures every fusion parameter keyed by canonical name.
    pub fn state_dict(&self) -> DetectResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores every fusion parameter from a state dict. Missing entries
    /// are an error, extra entries are ignored.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> DetectResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })?;
        Ok(())
    }

    /// Clears every fusion parameter accumulator.
    pub fn zero_accumulators(&mut self) -> DetectResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyTable;
    use crate::masks::DEFAULT_ORDERS;

    fn small_setup() -> (FusionNetwork, CandidateModel, Tensor, Tensor) {
        let table = FamilyTable::new();
        let num_queries = 2;
        let fusion = FusionNetwork::new(num_queries, 2 * DEFAULT_ORDERS.len(), &table).unwrap();
        let profile = table.profile(DatasetFamily::Cifar10);
        let candidate =
            CandidateModel::new(profile.input_width(), &[8], profile.num_classes).unwrap();
        let queries =
            Tensor::random_uniform(num_queries, profile.input_width(), 0.0, 1.0, Some(3)).unwrap();
        let distances = Tensor::from_vec(
            1,
            2 * DEFAULT_ORDERS.len(),
            vec![0.5; 2 * DEFAULT_ORDERS.len()],
        )
        .unwrap();
        (fusion, candidate, queries, distances)
    }

    #[test]
    fn score_is_deterministic_and_finite() {
        let (fusion, candidate, queries, distances) = small_setup();
        let a = fusion
            .score(&candidate, DatasetFamily::Cifar10, &queries, &distances)
            .unwrap();
        let b = fusion
            .score(&candidate, DatasetFamily::Cifar10, &queries, &distances)
            .unwrap();
        assert_eq!(a, b);
        assert!(a.is_finite());
    }

    #[test]
    fn unsupported_family_is_rejected() {
        let (fusion, candidate, queries, distances) = small_setup();
        assert!(matches!(
            fusion.score(&candidate, DatasetFamily::Mnist, &queries, &distances),
            Err(DetectError::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn distance_width_is_validated() {
        let (fusion, candidate, queries, _) = small_setup();
        let wrong = Tensor::from_vec(1, 3, vec![0.0; 3]).unwrap();
        assert!(fusion
            .score(&candidate, DatasetFamily::Cifar10, &queries, &wrong)
            .is_err());
    }

    #[test]
    fn backward_returns_query_gradient_and_fills_accumulators() {
        let (mut fusion, mut candidate, queries, distances) = small_setup();
        let trace = fusion
            .forward_traced(&candidate, DatasetFamily::Cifar10, &queries, &distances)
            .unwrap();
        let grad_queries = fusion
            .backward(&mut candidate, DatasetFamily::Cifar10, &queries, &trace, 1.0)
            .unwrap();
        assert_eq!(grad_queries.shape(), queries.shape());

        let mut with_grad = 0usize;
        fusion
            .visit_parameters(&mut |param| {
                if param.gradient().is_some() {
                    with_grad += 1;
                }
                Ok(())
            })
            .unwrap();
        // the touched affine, the norm, and all seven trunk layers
        assert!(with_grad >= 2 + 2 + 14);
    }

    #[test]
    fn state_dict_round_trip_preserves_score() {
        let (fusion, candidate, queries, distances) = small_setup();
        let state = fusion.state_dict().unwrap();

        let table = FamilyTable::new();
        let mut other = FusionNetwork::new(2, 2 * DEFAULT_ORDERS.len(), &table).unwrap();
        // perturb before loading so the restore is observable
        other
            .visit_parameters_mut(&mut |param| {
                for value in param.value_mut().data_mut() {
                    *value += 0.25;
                }
                Ok(())
            })
            .unwrap();
        other.load_state_dict(&state).unwrap();
        let original = fusion
            .score(&candidate, DatasetFamily::Cifar10, &queries, &distances)
            .unwrap();
        let restored = other
            .score(&candidate, DatasetFamily::Cifar10, &queries, &distances)
            .unwrap();
        assert_eq!(original, restored);
    }
}
