//! Embedded templates written by `kratos init`.

/// Default `kratos.toml` configuration.
pub(crate) const KRATOS_TOML: &str = include_str!("kratos.toml");

/// Example agent definition.
pub(crate) const AGENT_JSON: &str = include_str!("agent.json");
