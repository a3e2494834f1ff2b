// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Persistence for parameter state dictionaries.
//!
//! Everything the pipeline writes to disk is a state dict: parameter
//! tensors keyed by their canonical names. On disk the keys are ordered,
//! so JSON snapshots diff cleanly between epochs.

use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serialisable tensor payload used in snapshots and model files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl StoredTensor {
    /// Captures a tensor into its stored form.
    pub fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    /// Rebuilds the tensor, validating shape against payload length.
    pub fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// On-disk encoding of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// Pretty-printed JSON, inspectable and diff-friendly.
    Json,
    /// Compact bincode.
    Bincode,
}

impl SnapshotFormat {
    /// Picks the format from a path: a `.json` extension means JSON,
    /// anything else bincode.
    pub fn for_path(path: &Path) -> SnapshotFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Bincode,
        }
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes a state dict to `path` in the given format, overwriting any
/// previous snapshot.
pub fn save_state_dict<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
    format: SnapshotFormat,
) -> PureResult<()> {
    let stored: BTreeMap<&str, StoredTensor> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), StoredTensor::from_tensor(tensor)))
        .collect();
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    match format {
        SnapshotFormat::Json => serde_json::to_writer_pretty(writer, &stored).map_err(serde_error),
        SnapshotFormat::Bincode => bincode::serialize_into(writer, &stored).map_err(serde_error),
    }
}

/// Reads a state dict written by [`save_state_dict`].
pub fn load_state_dict<P: AsRef<Path>>(
    path: P,
    format: SnapshotFormat,
) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let stored: BTreeMap<String, StoredTensor> = match format {
        SnapshotFormat::Json => serde_json::from_reader(reader).map_err(serde_error)?,
        SnapshotFormat::Bincode => bincode::deserialize_from(reader).map_err(serde_error)?,
    };
    let mut state = HashMap::with_capacity(stored.len());
    for (name, tensor) in stored {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::module::Module;
    use tempfile::tempdir;

    #[test]
    fn state_dict_round_trips_in_both_formats() {
        let dir = tempdir().unwrap();
        let layer = Linear::new("io", 3, 2).unwrap();
        let state = layer.state_dict().unwrap();

        for (file, format) in [
            ("snap.json", SnapshotFormat::Json),
            ("snap.bin", SnapshotFormat::Bincode),
        ] {
            let path = dir.path().join(file);
            save_state_dict(&state, &path, format).unwrap();
            let restored = load_state_dict(&path, format).unwrap();
            assert_eq!(restored.len(), 2);
            assert_eq!(restored["io::weight"], *layer.weight().value());
            assert_eq!(restored["io::bias"], *layer.bias().value());
        }
    }

    #[test]
    fn format_follows_path_extension() {
        assert_eq!(
            SnapshotFormat::for_path(Path::new("run.json")),
            SnapshotFormat::Json
        );
        assert_eq!(
            SnapshotFormat::for_path(Path::new("run.bin")),
            SnapshotFormat::Bincode
        );
        assert_eq!(
            SnapshotFormat::for_path(Path::new("run")),
            SnapshotFormat::Bincode
        );
    }

    #[test]
    fn malformed_shape_is_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let raw = r#"{ "p": { "rows": 2, "cols": 3, "data": [1.0] } }"#;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            load_state_dict(&path, SnapshotFormat::Json),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_state_dict(&missing, SnapshotFormat::Json),
            Err(TensorError::IoError { .. })
        ));
    }
}
