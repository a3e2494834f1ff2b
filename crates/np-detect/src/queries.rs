// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::error::{DetectError, DetectResult};
use crate::family::{DatasetFamily, FamilyTable, SUPPORTED_FAMILIES};
use np_nn::{Parameter, PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Seam for producing the initial probe batch of a family.
///
/// The production system seeds from a real held-out sample of the family's
/// data distribution; that sampling stays external to this crate, so the
/// trait is the contract and [`UniformSeeder`] the in-repo default.
pub trait QuerySeeder {
    fn seed(&self, family: DatasetFamily, num_queries: usize, width: usize) -> PureResult<Tensor>;
}

/// Seeds probe batches uniformly in `[0, 1)`, deterministically per family.
#[derive(Debug, Clone, Copy)]
pub struct UniformSeeder {
    seed: u64,
}

impl UniformSeeder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl QuerySeeder for UniformSeeder {
    fn seed(&self, family: DatasetFamily, num_queries: usize, width: usize) -> PureResult<Tensor> {
        // Offset by family index so the three banks start from distinct draws.
        let offset = SUPPORTED_FAMILIES
            .iter()
            .position(|&f| f == family)
            .unwrap_or(SUPPORTED_FAMILIES.len()) as u64;
        Tensor::random_uniform(num_queries, width, 0.0, 1.0, Some(self.seed ^ (offset << 32)))
    }
}

/// One learnable probe batch per supported dataset family.
///
/// Entries are fixed at construction; the set is closed. Parameter names are
/// `queries::<token>` so bank state merges cleanly into run snapshots.
pub struct QueryBank {
    num_queries: usize,
    entries: Vec<(DatasetFamily, Parameter)>,
}

impl core::fmt::Debug for QueryBank {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "QueryBank(num_queries={},families={})",
            self.num_queries,
            self.entries.len()
        )
    }
}

impl QueryBank {
    /// Builds the bank with one entry per supported family, seeded through
    /// the provided seeder and projected into `[0, 1]`.
    pub fn new(
        num_queries: usize,
        table: &FamilyTable,
        seeder: &dyn QuerySeeder,
    ) -> DetectResult<Self> {
        if num_queries == 0 {
            return Err(DetectError::Config("num_queries must be non-zero".into()));
        }
        let mut entries = Vec::with_capacity(SUPPORTED_FAMILIES.len());
        for family in SUPPORTED_FAMILIES {
            let width = table.profile(family).input_width();
            let mut seeded = seeder.seed(family, num_queries, width)?;
            if seeded.shape() != (num_queries, width) {
                return Err(DetectError::Config(format!(
                    "seeder produced shape {:?} for {family}, expected ({num_queries}, {width})",
                    seeded.shape()
                )));
            }
            seeded.clamp_inplace(0.0, 1.0)?;
            entries.push((
                family,
                Parameter::new(format!("queries::{}", family.token()), seeded),
            ));
        }
        Ok(Self {
            num_queries,
            entries,
        })
    }

    /// Number of probe queries per family.
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    /// The probe batch for a family.
    pub fn batch(&self, family: DatasetFamily) -> DetectResult<&Tensor> {
        Ok(self.parameter(family)?.value())
    }

    /// The underlying parameter for a family.
    pub fn parameter(&self, family: DatasetFamily) -> DetectResult<&Parameter> {
        self.entries
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, p)| p)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))
    }

    /// Mutable access to the parameter for a family, for gradient
    /// accumulation.
    pub fn parameter_mut(&mut self, family: DatasetFamily) -> DetectResult<&mut Parameter> {
        self.entries
            .iter_mut()
            .find(|(f, _)| *f == family)
            .map(|(_, p)| p)
            .ok_or_else(|| DetectError::UnsupportedFamily(family.token().to_string()))
    }

    /// Visits every bank parameter mutably, in canonical family order.
    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (_, param) in &mut self.entries {
            visitor(param)?;
        }
        Ok(())
    }

    /// Projects every query element back into `[0, 1]`. Applied after each
    /// optimizer step; transient infeasible values may exist beforehand.
    pub fn clamp_unit_interval(&mut self) -> DetectResult<()> {
        for (_, param) in &mut self.entries {
            param.value_mut().clamp_inplace(0.0, 1.0)?;
        }
        Ok(())
    }

    /// Captures the bank as a state dict keyed by `queries::<token>`.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        self.entries
            .iter()
            .map(|(_, p)| (p.name().to_string(), p.value().clone()))
            .collect()
    }

    /// Restores the bank from a state dict. Missing entries are an error.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> DetectResult<()> {
        for (_, param) in &mut self.entries {
            let Some(value) = state.get(param.name()) else {
                return Err(DetectError::Tensor(TensorError::MissingParameter {
                    name: param.name().to_string(),
                }));
            };
            param.load_value(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_holds_one_entry_per_supported_family() {
        let table = FamilyTable::new();
        let bank = QueryBank::new(4, &table, &UniformSeeder::new(13)).unwrap();
        for family in SUPPORTED_FAMILIES {
            let batch = bank.batch(family).unwrap();
            assert_eq!(batch.shape(), (4, table.profile(family).input_width()));
            assert!(batch.data().iter().all(|v| (0.0..=1.0).contains(v)));
        }
        assert!(bank.batch(DatasetFamily::Mnist).is_err());
    }

    #[test]
    fn clamp_projects_out_of_range_values() {
        let table = FamilyTable::new();
        let mut bank = QueryBank::new(2, &table, &UniformSeeder::new(5)).unwrap();
        let param = bank.parameter_mut(DatasetFamily::Cifar10).unwrap();
        param.value_mut().data_mut()[0] = 4.2;
        param.value_mut().data_mut()[1] = -1.7;
        bank.clamp_unit_interval().unwrap();
        let batch = bank.batch(DatasetFamily::Cifar10).unwrap();
        assert_eq!(batch.data()[0], 1.0);
        assert_eq!(batch.data()[1], 0.0);
    }

    #[test]
    fn state_dict_round_trip() {
        let table = FamilyTable::new();
        let bank = QueryBank::new(2, &table, &UniformSeeder::new(21)).unwrap();
        let state = bank.state_dict();
        assert_eq!(state.len(), SUPPORTED_FAMILIES.len());
        assert!(state.contains_key("queries::CIFAR-10"));

        let mut other = QueryBank::new(2, &table, &UniformSeeder::new(99)).unwrap();
        other.load_state_dict(&state).unwrap();
        assert_eq!(
            other.batch(DatasetFamily::Gtsrb).unwrap(),
            bank.batch(DatasetFamily::Gtsrb).unwrap()
        );
    }

    #[test]
    fn seeding_is_deterministic() {
        let table = FamilyTable::new();
        let a = QueryBank::new(3, &table, &UniformSeeder::new(7)).unwrap();
        let b = QueryBank::new(3, &table, &UniformSeeder::new(7)).unwrap();
        assert_eq!(
            a.batch(DatasetFamily::Cifar100).unwrap(),
            b.batch(DatasetFamily::Cifar100).unwrap()
        );
    }
}
