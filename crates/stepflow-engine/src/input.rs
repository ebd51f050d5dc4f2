use serde::Serialize;
use serde_json::{Map, Value};

use stepflow_core::error::Result;
use stepflow_core::types::{MediaAttachment, StepInput};

/// The shapes a workflow accepts as input.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInput {
    /// Plain text message.
    Text(String),
    /// A map; its `message` key becomes the message, `media` is parsed as
    /// attachments, and the remaining keys go to `additional_data`.
    Structured(Map<String, Value>),
    /// Any serializable value, passed through as the message.
    Typed(Value),
}

impl WorkflowInput {
    /// Serialize a typed value as input.
    pub fn typed<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Typed(serde_json::to_value(value)?))
    }

    /// The raw input as JSON, before normalization.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Structured(map) => Value::Object(map.clone()),
            Self::Typed(v) => v.clone(),
        }
    }

    /// Normalize into the input handed to the first node.
    pub fn into_step_input(self) -> Result<StepInput> {
        match self {
            Self::Text(s) => Ok(StepInput::new(s)),
            Self::Typed(v) => Ok(StepInput::new(v)),
            Self::Structured(mut map) => {
                let media: Vec<MediaAttachment> = match map.remove("media") {
                    Some(Value::Null) | None => Vec::new(),
                    Some(value) => serde_json::from_value(value)?,
                };
                let mut input = match map.remove("message") {
                    Some(message) => {
                        let mut input = StepInput::new(message);
                        input.additional_data = map.into_iter().collect();
                        input
                    }
                    None => StepInput::new(Value::Object(map)),
                };
                input.media = media;
                Ok(input)
            }
        }
    }
}

impl From<&str> for WorkflowInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for WorkflowInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Map<String, Value>> for WorkflowInput {
    fn from(map: Map<String, Value>) -> Self {
        Self::Structured(map)
    }
}

impl From<Value> for WorkflowInput {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            Value::Object(map) => Self::Structured(map),
            other => Self::Typed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::types::MediaKind;

    #[test]
    fn text_becomes_message() {
        let input = WorkflowInput::from("hello").into_step_input().unwrap();
        assert_eq!(input.message, json!("hello"));
        assert!(input.additional_data.is_empty());
    }

    #[test]
    fn structured_splits_message_media_and_extras() {
        let input = WorkflowInput::from(json!({
            "message": "describe this",
            "user": "ada",
            "media": [{"kind": "image", "url": "https://example.com/a.png"}]
        }))
        .into_step_input()
        .unwrap();

        assert_eq!(input.message, json!("describe this"));
        assert_eq!(input.additional_data.get("user"), Some(&json!("ada")));
        assert_eq!(input.media.len(), 1);
        assert_eq!(input.media[0].kind, MediaKind::Image);
    }

    #[test]
    fn structured_without_message_is_passed_whole() {
        let input = WorkflowInput::from(json!({"a": 1})).into_step_input().unwrap();
        assert_eq!(input.message, json!({"a": 1}));
    }

    #[test]
    fn typed_values_serialize() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
        }
        let input = WorkflowInput::typed(&Order { id: 7 }).unwrap();
        assert_eq!(input.as_value(), json!({"id": 7}));
        let input = WorkflowInput::from(json!([1, 2])).into_step_input().unwrap();
        assert_eq!(input.message, json!([1, 2]));
    }

    #[test]
    fn malformed_media_is_an_error() {
        let result = WorkflowInput::from(json!({"message": "x", "media": "not a list"}))
            .into_step_input();
        assert!(result.is_err());
    }
}
