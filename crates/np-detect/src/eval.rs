// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Held-out evaluation: same per-example pipeline as training, no gradient
//! work, no parameter updates.

use crate::config::RunConfig;
use crate::corpus::ModelCorpusIndex;
use crate::error::{DetectError, DetectResult};
use crate::family::{DatasetFamily, FamilyTable};
use crate::fusion::FusionNetwork;
use crate::masks::{distance_vector, MaskExtractor, ReferenceMasks};
use crate::queries::QueryBank;
use np_nn::{BinaryCrossEntropyWithLogits, Loss, Tensor};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// 2x2 count table indexed `[predicted][actual]`, with trojan = 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    cells: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one decision made by the zero-threshold rule.
    pub fn record(&mut self, predicted_trojan: bool, actual_trojan: bool) {
        self.cells[usize::from(predicted_trojan)][usize::from(actual_trojan)] += 1;
    }

    pub fn count(&self, predicted_trojan: bool, actual_trojan: bool) -> usize {
        self.cells[usize::from(predicted_trojan)][usize::from(actual_trojan)]
    }

    /// Sum over all four cells: the number of non-skipped examples.
    pub fn total(&self) -> usize {
        self.cells.iter().flatten().sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "            actual:clean  actual:trojan")?;
        writeln!(
            f,
            "pred:clean  {:>12}  {:>13}",
            self.cells[0][0], self.cells[0][1]
        )?;
        write!(
            f,
            "pred:trojan {:>12}  {:>13}",
            self.cells[1][0], self.cells[1][1]
        )
    }
}

/// Aggregates produced by one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub mean_loss: f32,
    pub accuracy: f32,
    pub confusion: ConfusionMatrix,
    pub labels: Vec<f32>,
    pub scores: Vec<f32>,
    pub skipped: usize,
}

impl EvalReport {
    /// Ranking quality of the collected scores, `None` when only one class
    /// is present.
    pub fn auroc(&self) -> Option<f32> {
        roc_auc(&self.labels, &self.scores)
    }
}

/// Rank-based area under the ROC curve with tie-averaged ranks.
pub fn roc_auc(labels: &[f32], scores: &[f32]) -> Option<f32> {
    if labels.len() != scores.len() || labels.is_empty() {
        return None;
    }
    let positives = labels.iter().filter(|&&l| l > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // average ranks across tied scores
    let mut ranks = vec![0.0f32; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f32 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f32 = labels
        .iter()
        .zip(ranks.iter())
        .filter(|(&l, _)| l > 0.5)
        .map(|(_, &r)| r)
        .sum();
    let n_pos = positives as f32;
    let n_neg = negatives as f32;
    Some((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Runs the trained system over a labelled corpus slice.
pub struct EvaluationLoop<'a> {
    config: &'a RunConfig,
    table: FamilyTable,
    references: &'a HashMap<DatasetFamily, ReferenceMasks>,
    extractor: &'a dyn MaskExtractor,
}

impl<'a> EvaluationLoop<'a> {
    pub fn new(
        config: &'a RunConfig,
        references: &'a HashMap<DatasetFamily, ReferenceMasks>,
        extractor: &'a dyn MaskExtractor,
    ) -> DetectResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            table: FamilyTable::new(),
            references,
            extractor,
        })
    }

    fn example_score(
        &self,
        fusion: &FusionNetwork,
        bank: &QueryBank,
        model: &mut crate::candidate::CandidateModel,
        family: DatasetFamily,
    ) -> DetectResult<f32> {
        let mask = self.extractor.extract(model, family)?;
        model.zero_accumulators()?;
        let references = self
            .references
            .get(&family)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))?;
        let distances = distance_vector(&mask, references, self.config.distance_orders())?;
        fusion.score(model, family, bank.batch(family)?, &distances)
    }

    /// Evaluates `indices` of a labelled corpus: mean loss, accuracy,
    /// confusion matrix, and the raw label/score pairs for ranking metrics.
    /// Unsupported families are excluded from every aggregate.
    pub fn evaluate(
        &self,
        fusion: &FusionNetwork,
        bank: &QueryBank,
        corpus: &ModelCorpusIndex,
        indices: &[usize],
    ) -> DetectResult<EvalReport> {
        let mut loss = BinaryCrossEntropyWithLogits::new();
        let mut confusion = ConfusionMatrix::new();
        let mut labels = Vec::new();
        let mut scores = Vec::new();
        let mut loss_sum = 0.0f32;
        let mut correct = 0usize;
        let mut skipped = 0usize;

        for &index in indices {
            let (mut model, label, family) = corpus.load(index)?;
            if !family.is_supported() {
                skipped += 1;
                debug!(index, family = %family, "skipping unsupported family");
                continue;
            }
            let profile = self.table.profile(family);
            if model.num_classes() != profile.num_classes {
                return Err(DetectError::Metadata(format!(
                    "candidate with {} classes does not match {family} profile",
                    model.num_classes()
                )));
            }
            let target = label.target()?;
            let score = self.example_score(fusion, bank, &mut model, family)?;

            let prediction = Tensor::from_vec(1, 1, vec![score])?;
            let target_tensor = Tensor::from_vec(1, 1, vec![target])?;
            loss_sum += loss.forward(&prediction, &target_tensor)?.data()[0];

            let predicted_trojan = score > 0.0;
            let actual_trojan = target > 0.5;
            if predicted_trojan == actual_trojan {
                correct += 1;
            }
            confusion.record(predicted_trojan, actual_trojan);
            labels.push(target);
            scores.push(score);
        }

        let evaluated = labels.len();
        if evaluated == 0 {
            return Err(DetectError::Config(
                "no supported examples in evaluation slice".into(),
            ));
        }
        Ok(EvalReport {
            mean_loss: loss_sum / evaluated as f32,
            accuracy: correct as f32 / evaluated as f32,
            confusion,
            labels,
            scores,
            skipped,
        })
    }

    /// Scores an unlabelled corpus slice, returning `(index, score)` pairs.
    /// Unsupported families are omitted.
    pub fn score_all(
        &self,
        fusion: &FusionNetwork,
        bank: &QueryBank,
        corpus: &ModelCorpusIndex,
        indices: &[usize],
    ) -> DetectResult<Vec<(usize, f32)>> {
        let mut out = Vec::with_capacity(indices.len());
        for &index in indices {
            let (mut model, _, family) = corpus.load(index)?;
            if !family.is_supported() {
                continue;
            }
            let score = self.example_score(fusion, bank, &mut model, family)?;
            out.push((index, score));
        }
        Ok(out)
    }
}
