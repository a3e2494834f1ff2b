// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! The per-example training state machine.
//!
//! Each supported example runs: freeze candidate, extract mask, build the
//! distance feature against the reference pair, fusion forward, BCE loss,
//! backward restricted to fusion + query parameters, Adam step, query
//! clamp. Unsupported families are counted skips, not errors. The optimizer
//! only ever sees the two explicitly registered parameter collections; the
//! candidate's accumulators are written and thrown away with the model.

use crate::config::RunConfig;
use crate::corpus::ModelCorpusIndex;
use crate::error::{DetectError, DetectResult};
use crate::family::{DatasetFamily, FamilyTable, SUPPORTED_FAMILIES};
use crate::fusion::FusionNetwork;
use crate::masks::{distance_vector, MaskExtractor, ReferenceMasks};
use crate::queries::{QueryBank, QuerySeeder};
use crate::snapshot;
use np_nn::{
    AdamOptimizer, BinaryCrossEntropyWithLogits, Loss, LrScheduler, StepDecayScheduler, Tensor,
};
use np_tensor::{permutation, seeded_rng};
use std::collections::HashMap;
use tracing::{debug, info};

/// Aggregate counters for one completed epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub epoch: usize,
    pub examples: usize,
    pub skipped: usize,
    pub loss_ema: f32,
    pub learning_rate: f32,
}

/// Smoothed loss update: seeded by the first observed loss, no bias
/// correction afterwards.
fn update_ema(previous: Option<f32>, decay: f32, loss: f32) -> f32 {
    match previous {
        None => loss,
        Some(prev) => decay * prev + (1.0 - decay) * loss,
    }
}

/// Loads the immutable reference-mask pair for every supported family.
pub fn load_reference_masks(
    config: &RunConfig,
    extractor: &dyn MaskExtractor,
) -> DetectResult<HashMap<DatasetFamily, ReferenceMasks>> {
    let mut references = HashMap::new();
    for family in SUPPORTED_FAMILIES {
        let masks = ReferenceMasks::load(config.reference_root(), family, extractor)?;
        references.insert(family, masks);
    }
    Ok(references)
}

/// Orchestrates epochs over a training corpus.
pub struct TrainingLoop<'a> {
    config: &'a RunConfig,
    table: FamilyTable,
    fusion: FusionNetwork,
    bank: QueryBank,
    references: HashMap<DatasetFamily, ReferenceMasks>,
    extractor: &'a dyn MaskExtractor,
    optimizer: AdamOptimizer,
    scheduler: StepDecayScheduler,
    loss: BinaryCrossEntropyWithLogits,
    loss_ema: Option<f32>,
}

impl<'a> TrainingLoop<'a> {
    /// Builds the loop: validated config, freshly initialized fusion
    /// network, seeded query bank, reference masks extracted once.
    pub fn new(
        config: &'a RunConfig,
        extractor: &'a dyn MaskExtractor,
        seeder: &dyn QuerySeeder,
    ) -> DetectResult<Self> {
        config.validate()?;
        let table = FamilyTable::new();
        let bank = QueryBank::new(config.num_queries(), &table, seeder)?;
        let fusion = FusionNetwork::new(config.num_queries(), config.distance_width(), &table)?;
        let references = load_reference_masks(config, extractor)?;
        let optimizer =
            AdamOptimizer::new(config.learning_rate())?.with_weight_decay(config.weight_decay());
        let scheduler = StepDecayScheduler::new(
            config.learning_rate(),
            config.lr_step_every(),
            config.lr_gamma(),
        )?;
        Ok(Self {
            config,
            table,
            fusion,
            bank,
            references,
            extractor,
            optimizer,
            scheduler,
            loss: BinaryCrossEntropyWithLogits::new(),
            loss_ema: None,
        })
    }

    /// The trained components, borrowed for evaluation.
    pub fn components(&self) -> (&FusionNetwork, &QueryBank) {
        (&self.fusion, &self.bank)
    }

    /// The reference masks computed at construction.
    pub fn references(&self) -> &HashMap<DatasetFamily, ReferenceMasks> {
        &self.references
    }

    /// Smoothed training loss, `None` before the first supported example.
    pub fn loss_ema(&self) -> Option<f32> {
        self.loss_ema
    }

    /// Consumes the loop, yielding the trained components.
    pub fn into_components(self) -> (FusionNetwork, QueryBank) {
        (self.fusion, self.bank)
    }

    /// Runs the configured number of epochs over `indices`, persisting a
    /// snapshot after each one.
    pub fn run(
        &mut self,
        corpus: &ModelCorpusIndex,
        indices: &[usize],
    ) -> DetectResult<Vec<EpochStats>> {
        let mut history = Vec::with_capacity(self.config.epochs());
        for epoch in 0..self.config.epochs() {
            let learning_rate = self.optimizer.learning_rate();
            let (examples, skipped) = self.train_epoch(corpus, indices, epoch)?;

            let next_rate = self.scheduler.step();
            self.optimizer.set_learning_rate(next_rate)?;
            snapshot::save(self.config.snapshot_path(), &self.fusion, &self.bank)?;

            let stats = EpochStats {
                epoch,
                examples,
                skipped,
                loss_ema: self.loss_ema.unwrap_or(f32::INFINITY),
                learning_rate,
            };
            info!(
                epoch = stats.epoch,
                examples = stats.examples,
                skipped = stats.skipped,
                loss_ema = stats.loss_ema,
                lr = stats.learning_rate,
                "epoch complete"
            );
            history.push(stats);
        }
        Ok(history)
    }

    fn train_epoch(
        &mut self,
        corpus: &ModelCorpusIndex,
        indices: &[usize],
        epoch: usize,
    ) -> DetectResult<(usize, usize)> {
        let mut rng = seeded_rng(self.config.seed().wrapping_add(epoch as u64 + 1));
        let order = permutation(indices.len(), &mut rng);

        let mut examples = 0usize;
        let mut skipped = 0usize;
        for &pos in &order {
            let index = indices[pos];
            let (mut model, label, family) = corpus.load(index)?;
            if !family.is_supported() {
                skipped += 1;
                debug!(index, family = %family, "skipping unsupported family");
                continue;
            }
            let loss_value = self.train_example(&mut model, label.target()?, family)?;
            examples += 1;

            self.loss_ema = Some(update_ema(
                self.loss_ema,
                self.config.ema_decay(),
                loss_value,
            ));
        }
        Ok((examples, skipped))
    }

    fn train_example(
        &mut self,
        model: &mut crate::candidate::CandidateModel,
        target: f32,
        family: DatasetFamily,
    ) -> DetectResult<f32> {
        let profile = self.table.profile(family);
        if model.num_classes() != profile.num_classes
            || model.input_width() != profile.input_width()
        {
            return Err(DetectError::Metadata(format!(
                "candidate shape {}->{} does not match {family} profile",
                model.input_width(),
                model.num_classes()
            )));
        }

        let mask = self.extractor.extract(model, family)?;
        model.zero_accumulators()?;
        let references = self
            .references
            .get(&family)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))?;
        let distances = distance_vector(&mask, references, self.config.distance_orders())?;

        let queries = self.bank.batch(family)?.clone();
        let trace = self
            .fusion
            .forward_traced(model, family, &queries, &distances)?;

        let prediction = Tensor::from_vec(1, 1, vec![trace.logit()])?;
        let target_tensor = Tensor::from_vec(1, 1, vec![target])?;
        let loss_value = self.loss.forward(&prediction, &target_tensor)?.data()[0];
        let grad_logit = self.loss.backward(&prediction, &target_tensor)?.data()[0];

        let grad_queries = self
            .fusion
            .backward(model, family, &queries, &trace, grad_logit)?;
        self.bank
            .parameter_mut(family)?
            .accumulate_euclidean(&grad_queries)?;

        let optimizer = &mut self.optimizer;
        optimizer.begin_step();
        self.fusion
            .visit_parameters_mut(&mut |param| optimizer.step_parameter(param))?;
        self.bank
            .visit_parameters_mut(&mut |param| optimizer.step_parameter(param))?;
        self.bank.clamp_unit_interval()?;

        Ok(loss_value)
    }
}
