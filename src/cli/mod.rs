//! Command-line interface for gated-repair.
//!
//! Provides commands for single-bug repair, batch runs, index builds and
//! listing the gate-policy presets.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
