// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Run snapshots: the merged trained state of the fusion network and the
//! query bank, persisted after every epoch and overwriting the previous
//! file. There is no versioning; partial progress on interruption is
//! whatever was last written.

use crate::error::DetectResult;
use crate::fusion::FusionNetwork;
use crate::queries::QueryBank;
use np_nn::io::{self, SnapshotFormat};
use std::path::Path;

/// Saves the merged `fusion::*` + `queries::*` state dict. The on-disk
/// format follows the path extension.
pub fn save(path: impl AsRef<Path>, fusion: &FusionNetwork, bank: &QueryBank) -> DetectResult<()> {
    let path = path.as_ref();
    let mut state = fusion.state_dict()?;
    state.extend(bank.state_dict());
    io::save_state_dict(&state, path, SnapshotFormat::for_path(path))?;
    Ok(())
}

/// Restores both components in place from a snapshot written by [`save`].
pub fn load(
    path: impl AsRef<Path>,
    fusion: &mut FusionNetwork,
    bank: &mut QueryBank,
) -> DetectResult<()> {
    let path = path.as_ref();
    let state = io::load_state_dict(path, SnapshotFormat::for_path(path))?;
    fusion.load_state_dict(&state)?;
    bank.load_state_dict(&state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{DatasetFamily, FamilyTable};
    use crate::queries::UniformSeeder;
    use tempfile::tempdir;

    fn fixtures() -> (FusionNetwork, QueryBank) {
        let table = FamilyTable::new();
        let fusion = FusionNetwork::new(2, 8, &table).unwrap();
        let bank = QueryBank::new(2, &table, &UniformSeeder::new(4)).unwrap();
        (fusion, bank)
    }

    #[test]
    fn snapshot_round_trip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        let (fusion, bank) = fixtures();
        save(&path, &fusion, &bank).unwrap();

        let (mut fusion2, mut bank2) = fixtures();
        bank2
            .parameter_mut(DatasetFamily::Cifar10)
            .unwrap()
            .value_mut()
            .data_mut()[0] = 0.123_456;
        load(&path, &mut fusion2, &mut bank2).unwrap();
        assert_eq!(
            bank.batch(DatasetFamily::Cifar10).unwrap(),
            bank2.batch(DatasetFamily::Cifar10).unwrap()
        );
    }

    #[test]
    fn snapshot_overwrites_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let (fusion, mut bank) = fixtures();
        save(&path, &fusion, &bank).unwrap();
        let first_len = std::fs::metadata(&path).unwrap().len();

        bank.parameter_mut(DatasetFamily::Gtsrb)
            .unwrap()
            .value_mut()
            .data_mut()[0] = 0.777;
        save(&path, &fusion, &bank).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), first_len);

        let (mut fusion2, mut bank2) = fixtures();
        load(&path, &mut fusion2, &mut bank2).unwrap();
        assert_eq!(
            bank2
                .batch(DatasetFamily::Gtsrb)
                .unwrap()
                .data()[0],
            0.777
        );
    }
}
