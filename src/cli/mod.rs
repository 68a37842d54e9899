//! Command-line interface for fairq.
//!
//! Provides commands for running workers, enqueueing items and inspecting
//! partitions and dead letters.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
