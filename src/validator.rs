// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! JSON-Schema validation of YAML fragments.
//!
//! Merged values are YAML text; each managed target key may carry a JSON
//! Schema in its spec. The value is converted to JSON and checked against the
//! schema, with every violation collected into the returned error.

use jsonschema::JSONSchema;
use serde_json::Value;

/// Errors produced while validating a data value against a schema.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The data value was not parseable YAML.
    #[error("failed to parse yaml to json: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    /// The schema itself was malformed.
    #[error("failed to create schema: {0}")]
    InvalidSchema(String),

    /// The data value did not conform to the schema.
    #[error("failed validation with errors: [{}]", .violations.join("; "))]
    InvalidContent { violations: Vec<String> },
}

/// Validate YAML `data` against the JSON Schema in `json_schema`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidContent`] listing each violation when
/// the data does not conform, or the corresponding variant when the data or
/// schema cannot be parsed.
pub fn validate(json_schema: &str, data: &str) -> Result<(), ValidationError> {
    let instance: Value = serde_yaml::from_str(data)?;

    let schema: Value = serde_json::from_str(json_schema)
        .map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;
    let compiled =
        JSONSchema::compile(&schema).map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;

    if let Err(errors) = compiled.validate(&instance) {
        let violations: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(ValidationError::InvalidContent { violations });
    }

    Ok(())
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod validator_tests;
