//! Pipeline orchestration for a crawl-and-archive job.
//!
//! # Architecture
//!
//! - **Producer**: pages through upstream search and owns the cursor
//! - **Stage pools**: submission, comments and media, one pool each
//! - **ReportAggregator**: the single writer of the job report
//! - **Orchestrator**: wires the above together and supervises the run
//!
//! # Pipeline Flow
//!
//! 1. **Allocating**: the shared rate limiter and every worker are built
//! 2. **Running**: discovery publishes batches to all three stage queues
//! 3. **Draining**: discovery has closed the queues; pools finish in-flight work
//! 4. **Completed / Failed**: the report is finalized and persisted either way
//!
//! # Example
//!
//! ```rust,ignore
//! use post_archiver::pipeline::{ArchiverConfig, Orchestrator};
//! use post_archiver::storage::{JsonFileConfigStore, LocalStorage};
//! use std::sync::Arc;
//!
//! let config = ArchiverConfig::from_env()?.with_flair("DD");
//! let storage = Arc::new(LocalStorage::open("./archive").await?);
//! let state = Arc::new(JsonFileConfigStore::new("./archive-state.json"));
//!
//! let report = Orchestrator::new(config, storage, state).run().await?;
//! println!("{} submissions archived", report.submissions.len());
//! ```
//!
//! # Configuration
//!
//! ```rust,ignore
//! // Via builder pattern
//! let config = ArchiverConfig::new()
//!     .with_rate_limit(2.0, 4)
//!     .with_workers(StageKind::Media, 4);
//!
//! // Via environment variables
//! let config = ArchiverConfig::from_env()?;
//! ```

pub mod config;
pub mod orchestrator;
pub mod producer;
pub mod report;
pub mod types;

// Re-export main types for convenience
pub use config::{ArchiverConfig, ConfigError};
pub use orchestrator::{Orchestrator, PipelineState};
pub use producer::{DiscoverySummary, FlairFilter, NotifierPublisher, Producer, Publisher};
pub use report::{persist_report, JobReport, JobStatus, ReportAggregator, ReportHandle};
pub use types::{created_utc_of, Cursor, StageKind, StageOutcome, StageResult, WorkItem};
