use crate::CallError;
#[cfg(feature = "validation")]
use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// JSON Schema check applied to transformed response data
#[cfg(feature = "validation")]
pub struct SchemaValidator {
    schema: jsonschema::Validator,
}

#[cfg(feature = "validation")]
impl SchemaValidator {
    pub fn new(schema: Value) -> Result<Self, CallError> {
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|e| CallError::validation(format!("Invalid schema: {}", e)))?;
        Ok(SchemaValidator { schema: compiled })
    }

    pub fn from_type<T: JsonSchema>() -> Result<Self, CallError> {
        let schema = schema_for!(T);
        let schema_value = serde_json::to_value(schema)
            .map_err(|e| CallError::validation(format!("Schema serialization error: {}", e)))?;
        Self::new(schema_value)
    }

    /// Check `value`, reporting every violation in one validation error
    pub fn validate(&self, value: &Value) -> Result<(), CallError> {
        let problems: Vec<String> = self.schema.iter_errors(value).map(|e| e.to_string()).collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CallError::validation(format!(
                "Response validation failed: {}",
                problems.join("; ")
            )))
        }
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.schema.is_valid(value)
    }
}

#[cfg(not(feature = "validation"))]
pub struct SchemaValidator;

#[cfg(not(feature = "validation"))]
impl SchemaValidator {
    pub fn new(_schema: Value) -> Result<Self, CallError> {
        Err(CallError::validation("Validation feature not enabled"))
    }

    pub fn validate(&self, _value: &Value) -> Result<(), CallError> {
        Err(CallError::validation("Validation feature not enabled"))
    }

    pub fn is_valid(&self, _value: &Value) -> bool {
        true
    }
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchemaValidator")
    }
}
