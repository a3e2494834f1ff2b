// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Importance masks and mask-space distances.
//!
//! The interpretability routine that produces a candidate's mask is a
//! collaborator seam ([`MaskExtractor`]); what this module owns is the
//! distance arithmetic between masks and the fixed layout of the distance
//! vector fed into the fusion network.

use crate::candidate::CandidateModel;
use crate::error::{DetectError, DetectResult};
use crate::family::DatasetFamily;
use np_nn::{PureResult, Tensor, TensorError};
use std::fmt;
use std::path::Path;

/// Per-feature attribution map, one row wide per family input width.
pub type Mask = Tensor;

/// Named distance metrics used to compare two masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceOrder {
    L1,
    L2,
    LInf,
    Cosine,
}

/// The configured order set, in fixed iteration order.
pub const DEFAULT_ORDERS: [DistanceOrder; 4] = [
    DistanceOrder::L1,
    DistanceOrder::L2,
    DistanceOrder::LInf,
    DistanceOrder::Cosine,
];

impl DistanceOrder {
    /// The order token used in configuration.
    pub fn token(self) -> &'static str {
        match self {
            DistanceOrder::L1 => "1",
            DistanceOrder::L2 => "2",
            DistanceOrder::LInf => "inf",
            DistanceOrder::Cosine => "cos",
        }
    }

    /// Parses an order token.
    pub fn parse_token(token: &str) -> DetectResult<Self> {
        match token {
            "1" => Ok(DistanceOrder::L1),
            "2" => Ok(DistanceOrder::L2),
            "inf" => Ok(DistanceOrder::LInf),
            "cos" => Ok(DistanceOrder::Cosine),
            other => Err(DetectError::Config(format!(
                "unknown distance order token `{other}`"
            ))),
        }
    }
}

impl fmt::Display for DistanceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Computes one scalar distance per order, in the order given.
pub fn mask_distance(a: &Mask, b: &Mask, orders: &[DistanceOrder]) -> PureResult<Vec<f32>> {
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            left: a.shape(),
            right: b.shape(),
        });
    }
    if a.is_empty() {
        return Err(TensorError::EmptyInput("mask_distance"));
    }
    let mut out = Vec::with_capacity(orders.len());
    for order in orders {
        let value = match order {
            DistanceOrder::L1 => a
                .data()
                .iter()
                .zip(b.data())
                .map(|(x, y)| (x - y).abs())
                .sum(),
            DistanceOrder::L2 => a
                .data()
                .iter()
                .zip(b.data())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            DistanceOrder::LInf => a
                .data()
                .iter()
                .zip(b.data())
                .map(|(x, y)| (x - y).abs())
                .fold(0.0f32, f32::max),
            DistanceOrder::Cosine => {
                let dot: f32 = a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum();
                let norm = a.squared_l2_norm().sqrt() * b.squared_l2_norm().sqrt();
                if norm == 0.0 {
                    // two zero masks are identical, distance zero
                    0.0
                } else {
                    1.0 - dot / norm
                }
            }
        };
        out.push(value);
    }
    Ok(out)
}

/// The fixed pair of reference masks for one family, computed once before
/// training and immutable for the run.
#[derive(Debug, Clone)]
pub struct ReferenceMasks {
    pub clean: Mask,
    pub trojan: Mask,
}

impl ReferenceMasks {
    /// Extracts the reference pair for `family` from checkpoints laid out as
    /// `<root>/<token>/{clean,trojan}/model.bin`.
    pub fn load(
        reference_root: &Path,
        family: DatasetFamily,
        extractor: &dyn MaskExtractor,
    ) -> DetectResult<Self> {
        let family_dir = reference_root.join(family.token());
        let mut clean_model = CandidateModel::load(family_dir.join("clean").join("model.bin"))?;
        let mut trojan_model = CandidateModel::load(family_dir.join("trojan").join("model.bin"))?;
        Ok(Self {
            clean: extractor.extract(&mut clean_model, family)?,
            trojan: extractor.extract(&mut trojan_model, family)?,
        })
    }
}

/// Builds the `[1, 2 * |orders|]` distance feature: the clean-reference
/// block first, the trojan-reference block second.
pub fn distance_vector(
    mask: &Mask,
    references: &ReferenceMasks,
    orders: &[DistanceOrder],
) -> DetectResult<Tensor> {
    if orders.is_empty() {
        return Err(DetectError::Config("empty distance order set".into()));
    }
    let mut values = mask_distance(&references.clean, mask, orders)?;
    values.extend(mask_distance(&references.trojan, mask, orders)?);
    Ok(Tensor::from_vec(1, values.len(), values)?)
}

/// Seam for the interpretability routine producing a candidate's mask.
/// Deterministic and side-effect free apart from the candidate's gradient
/// accumulators, which callers clear afterwards.
pub trait MaskExtractor {
    fn extract(&self, model: &mut CandidateModel, family: DatasetFamily) -> DetectResult<Mask>;
}

/// Minimal in-repo extractor: mean absolute input gradient over a fixed
/// seeded probe batch. A stand-in for the heavier explanation routine the
/// production pipeline plugs in at this seam.
#[derive(Debug, Clone, Copy)]
pub struct InputSaliencyExtractor {
    probes: usize,
    seed: u64,
}

impl InputSaliencyExtractor {
    pub fn new(probes: usize, seed: u64) -> DetectResult<Self> {
        if probes == 0 {
            return Err(DetectError::Config(
                "saliency extractor needs at least one probe".into(),
            ));
        }
        Ok(Self { probes, seed })
    }
}

impl MaskExtractor for InputSaliencyExtractor {
    fn extract(&self, model: &mut CandidateModel, family: DatasetFamily) -> DetectResult<Mask> {
        let width = model.input_width();
        let offset = family.token().len() as u64;
        let probes = Tensor::random_uniform(
            self.probes,
            width,
            0.0,
            1.0,
            Some(self.seed.wrapping_add(offset)),
        )?;
        let responses = model.forward(&probes)?;
        let (rows, cols) = responses.shape();
        let ones = Tensor::from_vec(rows, cols, vec![1.0; rows * cols])?;
        let grad = model.backward_input(&probes, &ones)?;
        model.zero_accumulators()?;

        let mut mask = vec![0.0f32; width];
        for row in grad.data().chunks(width) {
            for (dst, &g) in mask.iter_mut().zip(row.iter()) {
                *dst += g.abs();
            }
        }
        for value in mask.iter_mut() {
            *value /= self.probes as f32;
        }
        Ok(Tensor::from_vec(1, width, mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks() -> (Mask, Mask) {
        let a = Tensor::from_vec(1, 4, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let b = Tensor::from_vec(1, 4, vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        (a, b)
    }

    #[test]
    fn order_tokens_round_trip() {
        for order in DEFAULT_ORDERS {
            assert_eq!(DistanceOrder::parse_token(order.token()).unwrap(), order);
        }
        assert!(DistanceOrder::parse_token("3").is_err());
    }

    #[test]
    fn distances_match_manual_values() {
        let (a, b) = masks();
        let values = mask_distance(&a, &b, &DEFAULT_ORDERS).unwrap();
        assert_eq!(values.len(), 4);
        assert!((values[0] - 2.0).abs() < 1e-6);
        assert!((values[1] - std::f32::consts::SQRT_2).abs() < 1e-6);
        assert!((values[2] - 1.0).abs() < 1e-6);
        // orthogonal masks: cosine distance 1
        assert!((values[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn identical_masks_have_zero_distance() {
        let (a, _) = masks();
        let values = mask_distance(&a, &a, &DEFAULT_ORDERS).unwrap();
        for value in values {
            assert!(value.abs() < 1e-6);
        }
    }

    #[test]
    fn distance_vector_layout_is_clean_block_first() {
        let (a, b) = masks();
        let refs = ReferenceMasks {
            clean: a.clone(),
            trojan: b,
        };
        // candidate mask equals the clean reference
        let vector = distance_vector(&a, &refs, &DEFAULT_ORDERS).unwrap();
        assert_eq!(vector.shape(), (1, 2 * DEFAULT_ORDERS.len()));
        for i in 0..DEFAULT_ORDERS.len() {
            assert!(vector.data()[i].abs() < 1e-6);
        }
        assert!(vector.data()[DEFAULT_ORDERS.len()] > 0.0);
    }

    #[test]
    fn saliency_extractor_is_deterministic() {
        let mut model = CandidateModel::new(8, &[4], 2).unwrap();
        let extractor = InputSaliencyExtractor::new(3, 17).unwrap();
        let first = extractor
            .extract(&mut model, DatasetFamily::Cifar10)
            .unwrap();
        let second = extractor
            .extract(&mut model, DatasetFamily::Cifar10)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shape(), (1, 8));
        assert!(first.data().iter().all(|v| *v >= 0.0));
    }
}
