use std::io;

use serde::Deserialize;
use serde::Serialize;
use stepwise_apply_patch::ApplyPatchError;
use stepwise_apply_patch::ParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentErr>;

/// Coarse classification of an LLM failure. Informational only: nothing is
/// retried based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LlmErrorKind {
    Network,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind == LlmErrorKind::Network
    }
}

impl From<io::Error> for LlmError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | TimedOut | UnexpectedEof => Self::network(err.to_string()),
            _ => Self::other(err.to_string()),
        }
    }
}

/// Failure of a single tool call. These never abort a turn (except
/// `Cancelled`); their text is recorded as the call's result instead.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to parse patch: {0}")]
    Parse(ParseError),

    #[error("failed to apply patch: {0}")]
    Apply(ApplyPatchError),

    #[error("patch rejected: {reason}")]
    Rejected { reason: String },

    #[error("failed to parse function arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),

    #[error("unsupported call: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<ParseError> for ToolError {
    fn from(err: ParseError) -> Self {
        ToolError::Parse(err)
    }
}

impl From<ApplyPatchError> for ToolError {
    fn from(err: ApplyPatchError) -> Self {
        match err {
            ApplyPatchError::ParseError(e) => ToolError::Parse(e),
            other => ToolError::Apply(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum AgentErr {
    /// Any failure from the model client. Fatal to the turn.
    #[error("llm error ({}): {}", .0.kind, .0.message)]
    Llm(#[from] LlmError),

    /// The turn's cancellation token fired during an LLM call, an approval
    /// wait or a tool call.
    #[error("interrupted (Ctrl-C)")]
    Interrupted,

    #[error("a turn is already running for this session")]
    TurnInProgress,

    #[error("config error: {0}")]
    Config(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
