//! Size partitions used to route data-file work to differently provisioned queues.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size class of a data file. Ordered from smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileSizePartition {
    /// Zero-byte files.
    Empty,
    /// Below the medium threshold.
    Small,
    /// At or above the medium threshold and below the large threshold.
    Medium,
    /// At or above the large threshold.
    Large,
}

impl FileSizePartition {
    /// All partitions in ascending order.
    pub const ALL: [Self; 4] = [Self::Empty, Self::Small, Self::Medium, Self::Large];

    /// Returns the partition name used in queue names and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for FileSizePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte thresholds separating the size partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionThresholds {
    medium: u64,
    large: u64,
}

impl PartitionThresholds {
    /// Creates thresholds, requiring `0 < medium < large`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the thresholds are not strictly increasing.
    pub fn new(medium: u64, large: u64) -> Result<Self> {
        if medium == 0 || medium >= large {
            return Err(Error::InvalidInput(format!(
                "partition thresholds must satisfy 0 < medium ({medium}) < large ({large})"
            )));
        }
        Ok(Self { medium, large })
    }

    /// Classifies a file size. Boundaries are exact: a file of exactly
    /// `medium` bytes is `Medium`, exactly `large` bytes is `Large`.
    #[must_use]
    pub const fn classify(&self, size: u64) -> FileSizePartition {
        if size == 0 {
            FileSizePartition::Empty
        } else if size < self.medium {
            FileSizePartition::Small
        } else if size < self.large {
            FileSizePartition::Medium
        } else {
            FileSizePartition::Large
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> PartitionThresholds {
        PartitionThresholds::new(1000, 2000).expect("valid thresholds")
    }

    #[test]
    fn boundaries_are_exact() {
        let t = thresholds();
        assert_eq!(t.classify(0), FileSizePartition::Empty);
        assert_eq!(t.classify(1), FileSizePartition::Small);
        assert_eq!(t.classify(999), FileSizePartition::Small);
        assert_eq!(t.classify(1000), FileSizePartition::Medium);
        assert_eq!(t.classify(1999), FileSizePartition::Medium);
        assert_eq!(t.classify(2000), FileSizePartition::Large);
        assert_eq!(t.classify(u64::MAX), FileSizePartition::Large);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        assert!(PartitionThresholds::new(0, 10).is_err());
        assert!(PartitionThresholds::new(10, 10).is_err());
        assert!(PartitionThresholds::new(20, 10).is_err());
    }

    #[test]
    fn partitions_are_ordered() {
        let mut shuffled = vec![
            FileSizePartition::Large,
            FileSizePartition::Empty,
            FileSizePartition::Medium,
            FileSizePartition::Small,
        ];
        shuffled.sort();
        assert_eq!(shuffled, FileSizePartition::ALL.to_vec());
    }
}
