// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! Meta-classifier pipeline detecting trojaned neural networks by
//! black-box probing.
//!
//! A candidate classifier is probed with a learnable query batch, its
//! input-attribution mask is compared against fixed clean/trojan reference
//! masks, and a fusion network maps the probe responses plus the distance
//! feature to a single trojan logit. Training optimizes the queries and the
//! fusion network jointly, routing gradients through the frozen candidate
//! without ever updating it.

pub mod candidate;
pub mod config;
pub mod corpus;
pub mod error;
pub mod eval;
pub mod family;
pub mod fusion;
pub mod masks;
pub mod queries;
pub mod snapshot;
pub mod telemetry;
pub mod train;
pub mod zoo;

pub use candidate::CandidateModel;
pub use config::RunConfig;
pub use corpus::{CorpusSplit, Label, ModelCorpusIndex};
pub use error::{DetectError, DetectResult};
pub use eval::{roc_auc, ConfusionMatrix, EvalReport, EvaluationLoop};
pub use family::{DatasetFamily, FamilyProfile, FamilyTable, SUPPORTED_FAMILIES};
pub use fusion::{FusionNetwork, FusionTrace};
pub use masks::{
    distance_vector, mask_distance, DistanceOrder, InputSaliencyExtractor, Mask, MaskExtractor,
    ReferenceMasks, DEFAULT_ORDERS,
};
pub use queries::{QueryBank, QuerySeeder, UniformSeeder};
pub use train::{load_reference_masks, EpochStats, TrainingLoop};
