use serde::Deserialize;
use serde::Serialize;

/// One entry of the conversation history.
///
/// A tool call made alongside an assistant message is recorded right after
/// that message, and its result right after the call(s) of the same step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: String,
        content: String,
    },
    ToolCall {
        name: String,
        /// Opaque to the controller; each tool handler parses its own shape.
        arguments: serde_json::Value,
        call_id: String,
    },
    ToolResult {
        name: String,
        call_id: String,
        output: ToolOutput,
    },
}

impl ResponseItem {
    pub fn user_message(content: impl Into<String>) -> Self {
        Self::Message {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant_message(content: impl Into<String>) -> Self {
        Self::Message {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
}

// Display returns the raw `content` so callers can treat the output like a
// plain string.
impl std::fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.content)
    }
}

impl std::ops::Deref for ToolOutput {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.content
    }
}

/// A tool call as the model produced it. The id may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    #[serde(alias = "name")]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// A resolved tool call. `call_id` is unique within its turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub call_id: String,
}

/// Arguments of the `shell` tool.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ShellToolCallParams {
    pub command: Vec<String>,
    pub workdir: Option<String>,

    /// This is the maximum time in milliseconds that the command is allowed to run.
    #[serde(rename = "timeout")]
    // The wire format uses `timeout`, which has ambiguous units, so we use
    // `timeout_ms` as the field name so it is clear in code.
    pub timeout_ms: Option<u64>,
}

/// Arguments of the `read_file` tool.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ReadFileParams {
    pub path: String,
    /// 1-based line to start from.
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Arguments of the `apply_patch` tool.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ApplyPatchParams {
    pub input: String,
}
