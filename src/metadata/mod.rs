//! Submission metadata: the queryable summary of each archived post.
//!
//! - **generator**: backfills records from archived `post.json` files
//! - **store**: record type, paginated queries, memory and JSON-file stores
//! - **index**: the fixed set of (partition, sort) indexes queries may use

pub mod generator;
pub mod index;
pub mod store;

use thiserror::Error;

use crate::error::StorageError;
use crate::pipeline::config::ConfigError;

pub use generator::{derive_post_type, generate_metadata, metadata_for, BackfillSummary};
pub use index::{resolve_index, IndexSpec, PartitionField, SortField, INDEXES};
pub use store::{
    FieldEq, JsonFileMetadataStore, MemoryMetadataStore, MetadataPage, MetadataQuery,
    MetadataRecord, MetadataStore, SortOrder, MAX_PAGE_SIZE,
};

/// Errors raised by metadata generation and queries.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid query: {0}")]
    Query(#[from] ConfigError),
}
