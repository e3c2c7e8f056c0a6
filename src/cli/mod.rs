//! Command-line interface for queuectl.
//!
//! Provides commands for job submission, inspection, dead letter queue and
//! configuration management, worker control and metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
