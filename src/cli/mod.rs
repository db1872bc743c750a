//! Command-line interface for review-forge.
//!
//! Provides commands to run workers, submit jobs, inspect and replay the
//! dead letter queue, print statistics and apply migrations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
