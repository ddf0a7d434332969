//! Dependency extraction.
//!
//! Static analysis over the definition bytes: no model is loaded and no
//! network is touched. Identical bytes always yield identical sets, which
//! is what makes content-fingerprint caching sound.

use std::collections::BTreeSet;

use super::{AgentDefinition, ModelRef, ModelSpec, SCHEMA_VERSION};
use crate::config::parse_memory_limit;
use crate::error::EngineError;

/// Parse and validate a definition payload.
pub fn parse_definition(definition: &[u8]) -> Result<AgentDefinition, EngineError> {
    let text = std::str::from_utf8(definition)
        .map_err(|e| EngineError::definition_invalid(format!("payload is not UTF-8: {e}")))?;

    let parsed: AgentDefinition = serde_json::from_str(text)
        .map_err(|e| EngineError::definition_invalid(format!("malformed payload: {e}")))?;

    if parsed.schema_version != SCHEMA_VERSION {
        return Err(EngineError::definition_invalid(format!(
            "unsupported schema_version {} (expected {SCHEMA_VERSION})",
            parsed.schema_version
        )));
    }

    if let Some(memory) = &parsed.limits.max_memory {
        parse_memory_limit(memory).map_err(|_| {
            EngineError::definition_invalid(format!("invalid limits.max_memory '{memory}'"))
        })?;
    }

    if parsed.limits.timeout_seconds == Some(0) {
        return Err(EngineError::definition_invalid(
            "limits.timeout_seconds must be positive",
        ));
    }

    Ok(parsed)
}

/// Extract the set of model references a definition declares.
///
/// The agent's own model plus every tool-level model, de-duplicated.
pub fn extract(definition: &[u8]) -> Result<BTreeSet<ModelRef>, EngineError> {
    let parsed = parse_definition(definition)?;

    let mut refs = BTreeSet::new();
    refs.insert(to_model_ref(&parsed.model)?);

    for tool in &parsed.tools {
        if tool.name.trim().is_empty() {
            return Err(EngineError::definition_invalid("tool name cannot be empty"));
        }
        if let Some(model) = &tool.model {
            refs.insert(to_model_ref(model)?);
        }
    }

    Ok(refs)
}

fn to_model_ref(spec: &ModelSpec) -> Result<ModelRef, EngineError> {
    let provider = spec.provider.parse().map_err(EngineError::definition_invalid)?;

    let id = spec.id.trim();
    if id.is_empty() {
        return Err(EngineError::definition_invalid("model id cannot be empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(EngineError::definition_invalid(format!(
            "model id '{id}' contains whitespace"
        )));
    }

    Ok(ModelRef::new(provider, id))
}
