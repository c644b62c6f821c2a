//! Command-line interface for the scaffolder.
//!
//! Provides commands for listing templates, validating values and running a
//! task end to end with a streamed event log.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
