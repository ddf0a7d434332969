//! CLI command implementations.
//!
//! Each submodule implements one `kratos` subcommand. Output formatting
//! is kept in pure functions so it can be tested without an engine.

pub mod init;
pub mod invoke;
pub mod list;
pub mod prune;
pub mod remove;
pub mod submit;
pub mod usage;

use anyhow::Result;
use kratos::{Config, StatePaths};

/// Locations of the persisted engine state, without opening the engine.
fn state_paths(config: &Config) -> Result<StatePaths> {
    Ok(StatePaths::new(&config.storage.resolve()?))
}
