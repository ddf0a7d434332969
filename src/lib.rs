//! Kratos: an execution engine for ephemeral, model-bound AI agents.
//!
//! Agents are submitted once and built into an image together with the
//! models they declare. Every invocation then runs one task in a fresh
//! sandbox created from that image, which is destroyed as soon as the
//! task produces a result, fails, times out or is cancelled.
//!
//! [`Dispatcher`] is the entry point.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod image;
pub mod lock;
pub mod meter;
pub mod sandbox;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use dispatcher::{Dispatcher, PruneReport, StatePaths};
pub use error::{EngineError, ErrorCode};
