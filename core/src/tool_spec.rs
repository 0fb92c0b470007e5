use serde::Serialize;
use std::collections::BTreeMap;

/// Description of a tool as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonSchema,
}

/// Generic JSON‑Schema subset needed for our tool definitions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonSchema {
    String,
    Number,
    Array {
        items: Box<JsonSchema>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        required: &'static [&'static str],
        #[serde(rename = "additionalProperties")]
        additional_properties: bool,
    },
}

pub(crate) fn create_shell_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert(
        "command".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String),
        },
    );
    properties.insert("workdir".to_string(), JsonSchema::String);
    properties.insert("timeout".to_string(), JsonSchema::Number);

    ToolSpec {
        name: "shell".to_string(),
        description: "Runs a command (argv, no shell interpolation), and returns its output."
            .to_string(),
        parameters: JsonSchema::Object {
            properties,
            required: &["command"],
            additional_properties: false,
        },
    }
}

pub(crate) fn create_read_file_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert("path".to_string(), JsonSchema::String);
    properties.insert("offset".to_string(), JsonSchema::Number);
    properties.insert("limit".to_string(), JsonSchema::Number);

    ToolSpec {
        name: "read_file".to_string(),
        description: "Reads a text file relative to the working directory and returns its lines, numbered from 1."
            .to_string(),
        parameters: JsonSchema::Object {
            properties,
            required: &["path"],
            additional_properties: false,
        },
    }
}

pub(crate) fn create_apply_patch_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert("input".to_string(), JsonSchema::String);

    ToolSpec {
        name: "apply_patch".to_string(),
        description: "Edits files with a patch in the apply_patch format.".to_string(),
        parameters: JsonSchema::Object {
            properties,
            required: &["input"],
            additional_properties: false,
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn shell_tool_serializes_as_json_schema() {
        let v = serde_json::to_value(create_shell_tool()).unwrap();
        assert_eq!(
            v["parameters"],
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "array", "items": {"type": "string"}},
                    "timeout": {"type": "number"},
                    "workdir": {"type": "string"},
                },
                "required": ["command"],
                "additionalProperties": false,
            })
        );
    }
}
