//! Command-line interface for medbatch.
//!
//! Provides commands for running workers, submitting batches, querying batch
//! status, and maintaining the database and broker.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
