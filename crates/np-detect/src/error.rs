// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use np_tensor::TensorError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the detection pipeline.
///
/// The taxonomy is fail-fast: configuration and resource problems abort the
/// run immediately, numeric failures bubble up from the tensor layer, and the
/// only non-fatal condition in the whole pipeline (an unsupported dataset
/// family) is not an error at all but a counted skip.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Startup-time misconfiguration, e.g. an unrecognized label directory.
    #[error("configuration error: {0}")]
    Config(String),

    /// A checkpoint or metadata file indexed by the corpus is missing or
    /// unreadable.
    #[error("resource error at {path}: {message}")]
    Resource { path: PathBuf, message: String },

    /// Malformed or inconsistent per-model metadata.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// A dataset family outside the closed configured set was handed to a
    /// component that requires a supported one.
    #[error("unsupported dataset family `{0}`")]
    UnsupportedFamily(String),

    /// Numeric failure propagated from the tensor/nn substrate.
    #[error("numeric failure: {0}")]
    Tensor(#[from] TensorError),

    /// Serde failure while reading or writing model files.
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Result alias shared by the detection pipeline.
pub type DetectResult<T> = std::result::Result<T, DetectError>;

impl DetectError {
    pub(crate) fn resource(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        DetectError::Resource {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
