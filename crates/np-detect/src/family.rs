// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

use crate::error::{DetectError, DetectResult};
use std::fmt;

/// Closed set of dataset families appearing in detection corpora.
///
/// The supported set is `{CIFAR-10, CIFAR-100, GTSRB}`. `MNIST` parses
/// because it appears in corpus metadata, but examples tagged with it are
/// skipped by both loops rather than trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetFamily {
    Cifar10,
    Cifar100,
    Gtsrb,
    Mnist,
}

/// Families eligible for training and evaluation, in canonical order.
pub const SUPPORTED_FAMILIES: [DatasetFamily; 3] = [
    DatasetFamily::Cifar10,
    DatasetFamily::Cifar100,
    DatasetFamily::Gtsrb,
];

impl DatasetFamily {
    /// The metadata token used in `info.json` and parameter names.
    pub fn token(self) -> &'static str {
        match self {
            DatasetFamily::Cifar10 => "CIFAR-10",
            DatasetFamily::Cifar100 => "CIFAR-100",
            DatasetFamily::Gtsrb => "GTSRB",
            DatasetFamily::Mnist => "MNIST",
        }
    }

    /// Parses a metadata token. Unknown tokens are a fatal metadata error.
    pub fn parse_token(token: &str) -> DetectResult<Self> {
        match token {
            "CIFAR-10" => Ok(DatasetFamily::Cifar10),
            "CIFAR-100" => Ok(DatasetFamily::Cifar100),
            "GTSRB" => Ok(DatasetFamily::Gtsrb),
            "MNIST" => Ok(DatasetFamily::Mnist),
            other => Err(DetectError::Metadata(format!(
                "unknown dataset family token `{other}`"
            ))),
        }
    }

    /// Whether examples from this family participate in training and
    /// evaluation.
    pub fn is_supported(self) -> bool {
        SUPPORTED_FAMILIES.contains(&self)
    }
}

impl fmt::Display for DatasetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Static shape information for one dataset family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyProfile {
    pub num_classes: usize,
    pub resolution: usize,
    pub channels: usize,
}

impl FamilyProfile {
    /// Width of a flattened input image for this family.
    pub fn input_width(&self) -> usize {
        self.channels * self.resolution * self.resolution
    }
}

/// Lookup table mapping each family to its profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyTable;

impl FamilyTable {
    pub fn new() -> Self {
        Self
    }

    pub fn profile(&self, family: DatasetFamily) -> FamilyProfile {
        match family {
            DatasetFamily::Cifar10 => FamilyProfile {
                num_classes: 10,
                resolution: 32,
                channels: 3,
            },
            DatasetFamily::Cifar100 => FamilyProfile {
                num_classes: 100,
                resolution: 32,
                channels: 3,
            },
            DatasetFamily::Gtsrb => FamilyProfile {
                num_classes: 43,
                resolution: 32,
                channels: 3,
            },
            DatasetFamily::Mnist => FamilyProfile {
                num_classes: 10,
                resolution: 28,
                channels: 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for family in [
            DatasetFamily::Cifar10,
            DatasetFamily::Cifar100,
            DatasetFamily::Gtsrb,
            DatasetFamily::Mnist,
        ] {
            assert_eq!(DatasetFamily::parse_token(family.token()).unwrap(), family);
        }
        assert!(DatasetFamily::parse_token("SVHN").is_err());
    }

    #[test]
    fn mnist_parses_but_is_not_supported() {
        let mnist = DatasetFamily::parse_token("MNIST").unwrap();
        assert!(!mnist.is_supported());
        for family in SUPPORTED_FAMILIES {
            assert!(family.is_supported());
        }
    }

    #[test]
    fn profiles_match_family_shapes() {
        let table = FamilyTable::new();
        assert_eq!(table.profile(DatasetFamily::Cifar100).num_classes, 100);
        assert_eq!(table.profile(DatasetFamily::Gtsrb).num_classes, 43);
        assert_eq!(table.profile(DatasetFamily::Cifar10).input_width(), 3072);
        assert_eq!(table.profile(DatasetFamily::Mnist).input_width(), 784);
    }
}
