// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::error::{DetectError, DetectResult};
use crate::masks::{DistanceOrder, DEFAULT_ORDERS};
use std::path::{Path, PathBuf};

/// Immutable run configuration, built once at startup and passed by
/// reference into the training and evaluation loops.
///
/// Defaults mirror the production hyperparameters: 10 epochs, learning rate
/// 1e-5, no weight decay, staircase decay by 0.3 every 3 epochs, loss EMA
/// 0.95, 1000 probe queries per family.
#[derive(Debug, Clone)]
pub struct RunConfig {
    corpus_root: PathBuf,
    reference_root: PathBuf,
    snapshot_path: PathBuf,
    num_queries: usize,
    epochs: usize,
    learning_rate: f32,
    weight_decay: f32,
    lr_step_every: usize,
    lr_gamma: f32,
    ema_decay: f32,
    split_fraction: f32,
    seed: u64,
    distance_orders: Vec<DistanceOrder>,
}

impl RunConfig {
    /// Builds a configuration with production defaults for the given paths.
    pub fn new(
        corpus_root: impl Into<PathBuf>,
        reference_root: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            corpus_root: corpus_root.into(),
            reference_root: reference_root.into(),
            snapshot_path: snapshot_path.into(),
            num_queries: 1000,
            epochs: 10,
            learning_rate: 1e-5,
            weight_decay: 0.0,
            lr_step_every: 3,
            lr_gamma: 0.3,
            ema_decay: 0.95,
            split_fraction: 0.8,
            seed: 0,
            distance_orders: DEFAULT_ORDERS.to_vec(),
        }
    }

    pub fn with_num_queries(mut self, num_queries: usize) -> Self {
        self.num_queries = num_queries;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_lr_schedule(mut self, step_every: usize, gamma: f32) -> Self {
        self.lr_step_every = step_every;
        self.lr_gamma = gamma;
        self
    }

    pub fn with_ema_decay(mut self, ema_decay: f32) -> Self {
        self.ema_decay = ema_decay;
        self
    }

    pub fn with_split_fraction(mut self, split_fraction: f32) -> Self {
        self.split_fraction = split_fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_distance_orders(mut self, orders: Vec<DistanceOrder>) -> Self {
        self.distance_orders = orders;
        self
    }

    /// Validates every knob; called by the loops before use.
    pub fn validate(&self) -> DetectResult<()> {
        if self.num_queries == 0 {
            return Err(DetectError::Config("num_queries must be non-zero".into()));
        }
        if self.epochs == 0 {
            return Err(DetectError::Config("epochs must be non-zero".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DetectError::Config(format!(
                "learning rate {} must be positive and finite",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(DetectError::Config(format!(
                "weight decay {} must be non-negative",
                self.weight_decay
            )));
        }
        if self.lr_step_every == 0 || !(self.lr_gamma.is_finite() && self.lr_gamma > 0.0) {
            return Err(DetectError::Config("invalid lr schedule".into()));
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return Err(DetectError::Config(format!(
                "ema decay {} outside [0, 1)",
                self.ema_decay
            )));
        }
        if !(0.0..=1.0).contains(&self.split_fraction) {
            return Err(DetectError::Config(format!(
                "split fraction {} outside [0, 1]",
                self.split_fraction
            )));
        }
        if self.distance_orders.is_empty() {
            return Err(DetectError::Config("empty distance order set".into()));
        }
        Ok(())
    }

    pub fn corpus_root(&self) -> &Path {
        &self.corpus_root
    }

    pub fn reference_root(&self) -> &Path {
        &self.reference_root
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    pub fn lr_step_every(&self) -> usize {
        self.lr_step_every
    }

    pub fn lr_gamma(&self) -> f32 {
        self.lr_gamma
    }

    pub fn ema_decay(&self) -> f32 {
        self.ema_decay
    }

    pub fn split_fraction(&self) -> f32 {
        self.split_fraction
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn distance_orders(&self) -> &[DistanceOrder] {
        &self.distance_orders
    }

    /// Width of the distance feature: two reference blocks per order.
    pub fn distance_width(&self) -> usize {
        2 * self.distance_orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RunConfig::new("corpus", "refs", "snapshot.json");
        config.validate().unwrap();
        assert_eq!(config.num_queries(), 1000);
        assert_eq!(config.epochs(), 10);
        assert_eq!(config.distance_width(), 8);
    }

    #[test]
    fn invalid_knobs_are_rejected() {
        let base = RunConfig::new("c", "r", "s.json");
        assert!(base.clone().with_num_queries(0).validate().is_err());
        assert!(base.clone().with_learning_rate(-1.0).validate().is_err());
        assert!(base.clone().with_ema_decay(1.0).validate().is_err());
        assert!(base.clone().with_lr_schedule(0, 0.3).validate().is_err());
        assert!(base.with_distance_orders(Vec::new()).validate().is_err());
    }
}
