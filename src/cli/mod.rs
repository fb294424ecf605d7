//! Command-line interface for post-archiver.
//!
//! Provides the in-process `archive` pipeline plus the split commands used
//! when discovery and stage workers run as separate processes.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
