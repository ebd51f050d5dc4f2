use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepflow_core::error::{Result, StepflowError};

/// Expected JSON kind of a workflow input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Any,
    String,
    Object,
    Number,
    Bool,
    Array,
}

impl InputKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Object => value.is_object(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
        }
    }
}

/// Shape check applied to the raw input before a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub kind: InputKind,
    /// Keys that must be present when the input is an object.
    #[serde(default, alias = "required")]
    pub required_fields: Vec<String>,
}

impl InputSchema {
    pub fn new(kind: InputKind) -> Self {
        Self {
            kind,
            required_fields: Vec::new(),
        }
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if !self.kind.matches(value) {
            return Err(StepflowError::Validation(format!(
                "expected {:?} input, got {}",
                self.kind,
                kind_of(value)
            )));
        }
        if self.required_fields.is_empty() {
            return Ok(());
        }
        let Some(map) = value.as_object() else {
            return Err(StepflowError::Validation(format!(
                "required fields {:?} need an object input, got {}",
                self.required_fields,
                kind_of(value)
            )));
        };
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|f| !map.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(StepflowError::Validation(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_mismatch() {
        let schema = InputSchema::new(InputKind::Object);
        let err = schema.validate(&json!("text")).unwrap_err();
        assert!(matches!(err, StepflowError::Validation(ref m) if m.contains("got string")));
        assert!(schema.validate(&json!({})).is_ok());
    }

    #[test]
    fn required_fields() {
        let schema = InputSchema::new(InputKind::Object)
            .require("message")
            .require("user");
        assert!(schema.validate(&json!({"message": "hi", "user": "ada"})).is_ok());
        let err = schema.validate(&json!({"message": "hi"})).unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn required_fields_need_object() {
        let schema = InputSchema::new(InputKind::Any).require("message");
        assert!(schema.validate(&json!("plain")).is_err());
    }

    #[test]
    fn deserializes_from_toml() {
        let schema: InputSchema = toml::from_str("kind = \"string\"").unwrap();
        assert_eq!(schema.kind, InputKind::String);
        let schema: InputSchema =
            toml::from_str("kind = \"object\"\nrequired = [\"id\"]").unwrap();
        assert_eq!(schema.required_fields, vec!["id"]);
    }
}
