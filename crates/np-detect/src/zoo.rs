// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Synthetic model-zoo generation.
//!
//! Real corpora come from an external model zoo; this module fabricates
//! small stand-in checkpoints with the same on-disk layout so the demo and
//! the integration tests run without external data. Trojan checkpoints are
//! derived from clean ones by a biased parameter perturbation, enough for
//! the pipeline to have signal to chew on.

use crate::candidate::CandidateModel;
use crate::error::{DetectError, DetectResult};
use crate::family::{DatasetFamily, FamilyTable};
use std::fs;
use std::path::Path;

const ZOO_HIDDEN: [usize; 1] = [16];

fn write_info(entry_dir: &Path, family: DatasetFamily) -> DetectResult<()> {
    let info = serde_json::json!({ "dataset": family.token() });
    let path = entry_dir.join("info.json");
    fs::write(&path, info.to_string()).map_err(|err| DetectError::resource(&path, err))?;
    Ok(())
}

fn make_model(family: DatasetFamily, trojan: bool, seed: u64) -> DetectResult<CandidateModel> {
    let profile = FamilyTable::new().profile(family);
    let mut model = CandidateModel::new(profile.input_width(), &ZOO_HIDDEN, profile.num_classes)?;
    model.jitter_parameters(0.05, seed)?;
    if trojan {
        // a larger, differently-seeded perturbation acts as the backdoor
        // fingerprint the detector is expected to pick up
        model.jitter_parameters(0.2, seed ^ 0xdead_beef)?;
    }
    Ok(model)
}

fn write_entry(
    entry_dir: &Path,
    family: DatasetFamily,
    trojan: bool,
    seed: u64,
) -> DetectResult<()> {
    fs::create_dir_all(entry_dir).map_err(|err| DetectError::resource(entry_dir, err))?;
    make_model(family, trojan, seed)?.save(entry_dir.join("model.bin"))?;
    write_info(entry_dir, family)
}

/// Writes a labelled training corpus: `<root>/{clean,trojan}/id-<n>/`.
pub fn synthesize_corpus(
    root: impl AsRef<Path>,
    family: DatasetFamily,
    clean: usize,
    trojan: usize,
    seed: u64,
) -> DetectResult<()> {
    let root = root.as_ref();
    for i in 0..clean {
        let entry = root.join("clean").join(format!("id-{i:04}"));
        write_entry(&entry, family, false, seed.wrapping_add(i as u64))?;
    }
    for i in 0..trojan {
        let entry = root.join("trojan").join(format!("id-{i:04}"));
        write_entry(&entry, family, true, seed.wrapping_add(1000 + i as u64))?;
    }
    Ok(())
}

/// Writes a flat, unlabelled evaluation corpus: `<root>/id-<n>/`.
/// Entries alternate between clean-like and trojan-like checkpoints.
pub fn synthesize_flat_corpus(
    root: impl AsRef<Path>,
    family: DatasetFamily,
    count: usize,
    seed: u64,
) -> DetectResult<()> {
    let root = root.as_ref();
    for i in 0..count {
        let entry = root.join(format!("id-{i:04}"));
        write_entry(&entry, family, i % 2 == 1, seed.wrapping_add(i as u64))?;
    }
    Ok(())
}

/// Writes the reference checkpoints used for mask extraction:
/// `<root>/<token>/{clean,trojan}/model.bin`.
pub fn synthesize_references(
    root: impl AsRef<Path>,
    families: &[DatasetFamily],
    seed: u64,
) -> DetectResult<()> {
    let root = root.as_ref();
    for (i, &family) in families.iter().enumerate() {
        let family_dir = root.join(family.token());
        for (label, trojan) in [("clean", false), ("trojan", true)] {
            let dir = family_dir.join(label);
            fs::create_dir_all(&dir).map_err(|err| DetectError::resource(&dir, err))?;
            make_model(family, trojan, seed.wrapping_add(i as u64 * 17))?
                .save(dir.join("model.bin"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::SUPPORTED_FAMILIES;
    use tempfile::tempdir;

    #[test]
    fn corpus_layout_matches_contract() {
        let dir = tempdir().unwrap();
        synthesize_corpus(dir.path(), DatasetFamily::Gtsrb, 2, 1, 3).unwrap();
        assert!(dir.path().join("clean/id-0000/model.bin").exists());
        assert!(dir.path().join("clean/id-0001/info.json").exists());
        assert!(dir.path().join("trojan/id-0000/model.bin").exists());
    }

    #[test]
    fn references_cover_every_family() {
        let dir = tempdir().unwrap();
        synthesize_references(dir.path(), &SUPPORTED_FAMILIES, 9).unwrap();
        for family in SUPPORTED_FAMILIES {
            for label in ["clean", "trojan"] {
                assert!(dir
                    .path()
                    .join(family.token())
                    .join(label)
                    .join("model.bin")
                    .exists());
            }
        }
    }

    #[test]
    fn trojan_models_differ_from_clean_ones() {
        let clean = make_model(DatasetFamily::Cifar10, false, 5).unwrap();
        let trojan = make_model(DatasetFamily::Cifar10, true, 5).unwrap();
        let queries = np_nn::Tensor::random_uniform(2, clean.input_width(), 0.0, 1.0, Some(1))
            .unwrap();
        assert_ne!(
            clean.forward(&queries).unwrap(),
            trojan.forward(&queries).unwrap()
        );
    }
}
