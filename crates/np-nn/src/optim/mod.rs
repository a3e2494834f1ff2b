// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Adaptive optimisation and learning-rate scheduling.
//!
//! The optimizer keys its moment buffers by parameter name, so the same
//! instance can update parameters spread across several modules as long as
//! their canonical names stay unique.

use crate::module::{Module, Parameter};
use crate::{PureResult, TensorError};
use std::collections::HashMap;

/// Trait implemented by epoch-level learning-rate schedules.
pub trait LrScheduler {
    /// Advances the schedule by one epoch and returns the new rate.
    fn step(&mut self) -> f32;

    /// Returns the rate for the current epoch without advancing.
    fn current_lr(&self) -> f32;

    /// Rewinds the schedule to epoch zero.
    fn reset(&mut self);
}

/// Staircase decay: the rate is multiplied by `gamma` once every
/// `step_every` epochs.
#[derive(Debug, Clone)]
pub struct StepDecayScheduler {
    initial_lr: f32,
    step_every: usize,
    gamma: f32,
    epoch: usize,
}

impl StepDecayScheduler {
    /// Builds a scheduler, validating the initial rate.
    pub fn new(initial_lr: f32, step_every: usize, gamma: f32) -> PureResult<Self> {
        if initial_lr <= 0.0 || !initial_lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate { rate: initial_lr });
        }
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "scheduler_gamma",
                value: gamma,
            });
        }
        if step_every == 0 {
            return Err(TensorError::InvalidValue {
                label: "scheduler_step_every",
            });
        }
        Ok(Self {
            initial_lr,
            step_every,
            gamma,
            epoch: 0,
        })
    }
}

impl LrScheduler for StepDecayScheduler {
    fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.current_lr()
    }

    fn current_lr(&self) -> f32 {
        let decays = (self.epoch / self.step_every) as i32;
        self.initial_lr * self.gamma.powi(decays)
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Adam with bias correction and optional L2 weight decay.
///
/// `begin_step` advances the shared timestep once per optimisation step;
/// `step_parameter` may then be called for any number of parameters. First
/// and second moments are lazily allocated per parameter name.
pub struct AdamOptimizer {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    timestep: u32,
    first_moments: HashMap<String, Vec<f32>>,
    second_moments: HashMap<String, Vec<f32>>,
}

impl core::fmt::Debug for AdamOptimizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "AdamOptimizer(lr={},t={},tracked={})",
            self.learning_rate,
            self.timestep,
            self.first_moments.len()
        )
    }
}

impl AdamOptimizer {
    /// Creates an optimizer with the canonical Adam defaults
    /// (beta1 0.9, beta2 0.999, epsilon 1e-8, no weight decay).
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        Ok(Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            timestep: 0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
        })
    }

    /// Overrides the exponential decay rates for the moment estimates.
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Overrides the numerical-stability epsilon.
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Enables L2 weight decay folded into the gradient.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Replaces the learning rate, typically from a scheduler at epoch
    /// boundaries.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Advances the shared timestep. Call exactly once before the
    /// `step_parameter` calls that make up one optimisation step.
    pub fn begin_step(&mut self) {
        self.timestep = self.timestep.saturating_add(1);
    }

    /// Applies one Adam update to `parameter` and flushes its gradient
    /// accumulator. Parameters with no accumulated gradient are skipped.
    pub fn step_parameter(&mut self, parameter: &mut Parameter) -> PureResult<()> {
        if self.timestep == 0 {
            return Err(TensorError::InvalidValue {
                label: "adam_step_before_begin",
            });
        }
        let Some(gradient) = parameter.gradient() else {
            return Ok(());
        };
        let grad = gradient.data().to_vec();
        let name = parameter.name().to_string();
        let len = grad.len();

        let m = self
            .first_moments
            .entry(name.clone())
            .or_insert_with(|| vec![0.0; len]);
        if m.len() != len {
            return Err(TensorError::InvalidValue {
                label: "adam_moment_shape",
            });
        }
        let v = self
            .second_moments
            .entry(name)
            .or_insert_with(|| vec![0.0; len]);

        let bias1 = 1.0 - self.beta1.powi(self.timestep as i32);
        let bias2 = 1.0 - self.beta2.powi(self.timestep as i32);

        let values = parameter.value_mut().data_mut();
        for i in 0..len {
            let mut g = grad[i];
            if self.weight_decay > 0.0 {
                g += self.weight_decay * values[i];
            }
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            values[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        parameter.zero_gradient();
        Ok(())
    }

    /// Convenience wrapper that steps every parameter of a module.
    pub fn step_module(&mut self, module: &mut dyn Module) -> PureResult<()> {
        module.visit_parameters_mut(&mut |param| self.step_parameter(param))
    }

    /// Drops all moment buffers and rewinds the timestep.
    pub fn reset(&mut self) {
        self.first_moments.clear();
        self.second_moments.clear();
        self.timestep = 0;
    }
}
