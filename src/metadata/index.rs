//! Static table of the secondary indexes a metadata query may use.
//!
//! A query names a partition field (or none, for the constant partition) and
//! a sort field. Only the pairs listed in [`INDEXES`] are served; anything
//! else is rejected up front with [`ConfigError::UnsupportedIndex`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pipeline::config::ConfigError;

/// Field a query partitions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionField {
    /// Every record shares one constant partition.
    Constant,
    Author,
    PostType,
}

impl PartitionField {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionField::Constant => "none",
            PartitionField::Author => "author",
            PartitionField::PostType => "post_type",
        }
    }
}

impl fmt::Display for PartitionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field a query orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedUtc,
    Score,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::CreatedUtc => "created_utc",
            SortField::Score => "score",
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_utc" => Ok(SortField::CreatedUtc),
            "score" => Ok(SortField::Score),
            other => Err(ConfigError::InvalidValue {
                key: "sort".to_string(),
                message: format!("unknown sort field '{other}'"),
            }),
        }
    }
}

/// One physical index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub partition: PartitionField,
    pub sort: SortField,
    pub name: &'static str,
}

pub const INDEXES: [IndexSpec; 6] = [
    IndexSpec {
        partition: PartitionField::Constant,
        sort: SortField::CreatedUtc,
        name: "created_utc-index",
    },
    IndexSpec {
        partition: PartitionField::Constant,
        sort: SortField::Score,
        name: "score-index",
    },
    IndexSpec {
        partition: PartitionField::Author,
        sort: SortField::CreatedUtc,
        name: "author-created_utc-index",
    },
    IndexSpec {
        partition: PartitionField::Author,
        sort: SortField::Score,
        name: "author-score-index",
    },
    IndexSpec {
        partition: PartitionField::PostType,
        sort: SortField::CreatedUtc,
        name: "post_type-created_utc-index",
    },
    IndexSpec {
        partition: PartitionField::PostType,
        sort: SortField::Score,
        name: "post_type-score-index",
    },
];

/// Looks up the index serving `partition` sorted by `sort`.
///
/// `partition` is a record field name, or `None` for the constant partition.
///
/// # Errors
///
/// Returns `ConfigError::UnsupportedIndex` when no index covers the pair.
pub fn resolve_index(partition: Option<&str>, sort: &str) -> Result<&'static IndexSpec, ConfigError> {
    INDEXES
        .iter()
        .find(|index| {
            let partition_matches = match partition {
                None => index.partition == PartitionField::Constant,
                Some(field) => {
                    index.partition != PartitionField::Constant && index.partition.as_str() == field
                }
            };
            partition_matches && index.sort.as_str() == sort
        })
        .ok_or_else(|| ConfigError::UnsupportedIndex {
            partition: partition.unwrap_or("none").to_string(),
            sort: sort.to_string(),
        })
}
