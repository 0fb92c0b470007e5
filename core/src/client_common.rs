use crate::error::LlmError;
use crate::models::LlmToolCall;
use crate::models::ResponseItem;
use crate::tool_spec::ToolSpec;
use futures::Stream;
use serde::Deserialize;
use serde::Serialize;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use stepwise_apply_patch::APPLY_PATCH_TOOL_INSTRUCTIONS;
use tokio::sync::mpsc;

/// The instructions sent to a model should always start with this content.
const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");

/// Everything the model needs for one step of a turn.
#[derive(Default, Debug, Clone)]
pub struct Prompt {
    /// Conversation context input items, oldest first.
    pub input: Vec<ResponseItem>,
    /// Optional instructions from the user to amend to the built-in agent
    /// instructions.
    pub user_instructions: Option<String>,
    /// Tools the model may call.
    pub tools: Vec<ToolSpec>,
}

impl Prompt {
    /// Base prompt, user instructions, patch format and the tool list. The
    /// tool list is included for models that only speak free text and reply
    /// with a JSON tool call.
    pub fn get_full_instructions(&self) -> String {
        let mut sections: Vec<String> = vec![BASE_INSTRUCTIONS.to_string()];
        if let Some(ref user) = self.user_instructions {
            sections.push(user.clone());
        }
        sections.push(APPLY_PATCH_TOOL_INSTRUCTIONS.to_string());
        if !self.tools.is_empty() {
            let tools = serde_json::to_string_pretty(&self.tools).unwrap_or_default();
            sections.push(format!("## Available tools\n\n{tools}"));
        }
        sections.join("\n")
    }
}

/// Final result of one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    TextDelta(String),
    /// A partial tool call. Informational only; the complete calls arrive
    /// with `Completed`.
    ToolCallDelta {
        call_id: Option<String>,
        tool_name: String,
    },
    Completed(LlmResponse),
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent, LlmError>>,
}

impl ResponseStream {
    pub fn new(rx_event: mpsc::Receiver<Result<ResponseEvent, LlmError>>) -> Self {
        Self { rx_event }
    }

    /// A stream that yields `events` in order, then ends.
    pub fn from_events(events: Vec<Result<ResponseEvent, LlmError>>) -> Self {
        let (tx, rx_event) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers every event, so this cannot fail.
            let _ = tx.try_send(event);
        }
        Self { rx_event }
    }
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}
