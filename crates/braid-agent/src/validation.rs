//! JSON Schema validation for tool arguments and structured output.

use std::sync::Arc;

use serde_json::Value;

/// A value that failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", .errors.join("; "))]
pub struct ValidationError {
    /// One entry per violation.
    pub errors: Vec<String>,
}

impl ValidationError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

/// Checks a value against a JSON schema.
///
/// On success the (possibly normalized) value is returned.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, value: &Value) -> Result<Value, ValidationError>;
}

/// A validator that can be shared across threads.
pub type SharedValidator = Arc<dyn SchemaValidator>;

/// Default validator backed by the `jsonschema` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<Value, ValidationError> {
        let validator = jsonschema::Validator::new(schema)
            .map_err(|e| ValidationError::new(format!("invalid schema: {e}")))?;
        if validator.is_valid(value) {
            return Ok(value.clone());
        }
        let errors = validator.iter_errors(value).map(|e| e.to_string()).collect();
        Err(ValidationError::from_errors(errors))
    }
}
