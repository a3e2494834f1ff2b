// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::candidate::CandidateModel;
use crate::error::{DetectError, DetectResult};
use crate::family::DatasetFamily;
use np_tensor::{permutation, seeded_rng};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Ground-truth tag of a corpus entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Clean,
    Trojan,
    Unknown,
}

impl Label {
    /// Binary training target: 0 for clean, 1 for trojan.
    pub fn target(self) -> DetectResult<f32> {
        match self {
            Label::Clean => Ok(0.0),
            Label::Trojan => Ok(1.0),
            Label::Unknown => Err(DetectError::Metadata(
                "unlabelled entry cannot provide a training target".into(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntryInfo {
    dataset: String,
}

/// One indexed checkpoint directory.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    path: PathBuf,
    label: Label,
    family: DatasetFamily,
}

impl CorpusEntry {
    pub fn label(&self) -> Label {
        self.label
    }

    pub fn family(&self) -> DatasetFamily {
        self.family
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Deterministic 80/20 split of a corpus into train and validation index
/// sets.
#[derive(Debug, Clone)]
pub struct CorpusSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Enumerates a directory tree of candidate checkpoints.
///
/// Training layout: `<root>/clean/<id>/` and `<root>/trojan/<id>/`, each
/// entry holding `model.bin` and `info.json`. Entries are ordered by name
/// within each label directory, clean block first. Evaluation corpora are a
/// single flat directory of unlabelled entries.
#[derive(Debug)]
pub struct ModelCorpusIndex {
    entries: Vec<CorpusEntry>,
}

fn sorted_subdirs(dir: &Path) -> DetectResult<Vec<PathBuf>> {
    let read = fs::read_dir(dir).map_err(|err| DetectError::resource(dir, err))?;
    let mut dirs = Vec::new();
    for item in read {
        let item = item.map_err(|err| DetectError::resource(dir, err))?;
        if item.path().is_dir() {
            dirs.push(item.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_family(entry_dir: &Path) -> DetectResult<DatasetFamily> {
    let info_path = entry_dir.join("info.json");
    let raw =
        fs::read_to_string(&info_path).map_err(|err| DetectError::resource(&info_path, err))?;
    let info: EntryInfo =
        serde_json::from_str(&raw).map_err(|err| DetectError::resource(&info_path, err))?;
    DatasetFamily::parse_token(&info.dataset)
}

impl ModelCorpusIndex {
    /// Indexes a labelled training corpus. Any subdirectory of the root
    /// other than `clean` or `trojan` is a fatal configuration error.
    pub fn open_training(root: impl AsRef<Path>) -> DetectResult<Self> {
        let root = root.as_ref();
        for dir in sorted_subdirs(root)? {
            let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name != "clean" && name != "trojan" {
                return Err(DetectError::Config(format!(
                    "unexpected label directory `{}` under {}",
                    name,
                    root.display()
                )));
            }
        }

        let mut entries = Vec::new();
        for (dir_name, label) in [("clean", Label::Clean), ("trojan", Label::Trojan)] {
            let label_dir = root.join(dir_name);
            for entry_dir in sorted_subdirs(&label_dir)? {
                let family = read_family(&entry_dir)?;
                entries.push(CorpusEntry {
                    path: entry_dir,
                    label,
                    family,
                });
            }
        }
        if entries.is_empty() {
            return Err(DetectError::Config(format!(
                "no entries under {}",
                root.display()
            )));
        }
        Ok(Self { entries })
    }

    /// Indexes a flat, unlabelled evaluation corpus.
    pub fn open_evaluation(root: impl AsRef<Path>) -> DetectResult<Self> {
        let root = root.as_ref();
        let mut entries = Vec::new();
        for entry_dir in sorted_subdirs(root)? {
            let family = read_family(&entry_dir)?;
            entries.push(CorpusEntry {
                path: entry_dir,
                label: Label::Unknown,
                family,
            });
        }
        if entries.is_empty() {
            return Err(DetectError::Config(format!(
                "no entries under {}",
                root.display()
            )));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Metadata for one entry without loading its checkpoint.
    pub fn entry(&self, index: usize) -> DetectResult<&CorpusEntry> {
        self.entries
            .get(index)
            .ok_or_else(|| DetectError::Config(format!("corpus index {index} out of range")))
    }

    /// Loads the checkpoint for one entry. The returned model is meant to be
    /// dropped after the example; nothing is pooled or cached.
    pub fn load(&self, index: usize) -> DetectResult<(CandidateModel, Label, DatasetFamily)> {
        let entry = self.entry(index)?;
        let model = CandidateModel::load(entry.path.join("model.bin"))?;
        Ok((model, entry.label, entry.family))
    }

    /// Splits indices into train/validation by seeded permutation, keeping
    /// `fraction` of the corpus for training.
    pub fn split(&self, fraction: f32, seed: u64) -> DetectResult<CorpusSplit> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(DetectError::Config(format!(
                "split fraction {fraction} outside [0, 1]"
            )));
        }
        let mut rng = seeded_rng(seed);
        let shuffled = permutation(self.entries.len(), &mut rng);
        let pivot = (self.entries.len() as f32 * fraction) as usize;
        Ok(CorpusSplit {
            train: shuffled[..pivot].to_vec(),
            validation: shuffled[pivot..].to_vec(),
        })
    }

    /// All indices, in indexed order.
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.entries.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo;
    use tempfile::tempdir;

    #[test]
    fn training_index_orders_clean_before_trojan() {
        let dir = tempdir().unwrap();
        zoo::synthesize_corpus(dir.path(), DatasetFamily::Cifar10, 2, 3, 42).unwrap();
        let index = ModelCorpusIndex::open_training(dir.path()).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.entry(0).unwrap().label(), Label::Clean);
        assert_eq!(index.entry(1).unwrap().label(), Label::Clean);
        for i in 2..5 {
            assert_eq!(index.entry(i).unwrap().label(), Label::Trojan);
        }
    }

    #[test]
    fn unexpected_label_directory_is_fatal() {
        let dir = tempdir().unwrap();
        zoo::synthesize_corpus(dir.path(), DatasetFamily::Cifar10, 1, 1, 42).unwrap();
        fs::create_dir(dir.path().join("poisoned")).unwrap();
        assert!(matches!(
            ModelCorpusIndex::open_training(dir.path()),
            Err(DetectError::Config(_))
        ));
    }

    #[test]
    fn missing_checkpoint_is_resource_error() {
        let dir = tempdir().unwrap();
        zoo::synthesize_corpus(dir.path(), DatasetFamily::Gtsrb, 1, 1, 7).unwrap();
        let index = ModelCorpusIndex::open_training(dir.path()).unwrap();
        fs::remove_file(index.entry(0).unwrap().path().join("model.bin")).unwrap();
        assert!(matches!(
            index.load(0),
            Err(DetectError::Resource { .. })
        ));
    }

    #[test]
    fn split_is_deterministic_and_partitions() {
        let dir = tempdir().unwrap();
        zoo::synthesize_corpus(dir.path(), DatasetFamily::Cifar10, 5, 5, 1).unwrap();
        let index = ModelCorpusIndex::open_training(dir.path()).unwrap();
        let a = index.split(0.8, 99).unwrap();
        let b = index.split(0.8, 99).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.train.len(), 8);
        assert_eq!(a.validation.len(), 2);

        let mut all: Vec<usize> = a.train.iter().chain(a.validation.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, index.all_indices());
    }

    #[test]
    fn evaluation_index_is_flat_and_unlabelled() {
        let dir = tempdir().unwrap();
        zoo::synthesize_flat_corpus(dir.path(), DatasetFamily::Cifar10, 3, 5).unwrap();
        let index = ModelCorpusIndex::open_evaluation(dir.path()).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.entry(0).unwrap().label(), Label::Unknown);
        let (model, label, family) = index.load(1).unwrap();
        assert_eq!(label, Label::Unknown);
        assert_eq!(family, DatasetFamily::Cifar10);
        assert_eq!(model.num_classes(), 10);
    }
}
