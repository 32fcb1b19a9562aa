//! Command-line interface for persona-forge.
//!
//! Provides commands to run and resume pipelines, inspect runs and the
//! prompt catalog, and register adapter consumers.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
