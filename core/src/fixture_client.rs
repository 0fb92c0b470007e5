use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::client::LlmClient;
use crate::client_common::LlmResponse;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::error::AgentErr;
use crate::error::LlmError;
use crate::error::LlmErrorKind;
use crate::models::LlmToolCall;

/// One scripted model reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FixtureEntry {
    Error {
        error: String,
        #[serde(default = "default_error_kind")]
        kind: LlmErrorKind,
    },
    Response {
        #[serde(default)]
        text: String,
        #[serde(default)]
        tool_calls: Vec<LlmToolCall>,
    },
}

fn default_error_kind() -> LlmErrorKind {
    LlmErrorKind::Other
}

/// Replays scripted responses, one per call, for offline runs and tests.
#[derive(Debug)]
pub struct FixtureClient {
    entries: Mutex<VecDeque<FixtureEntry>>,
}

impl FixtureClient {
    pub fn new(entries: Vec<FixtureEntry>) -> Self {
        Self {
            entries: Mutex::new(entries.into()),
        }
    }

    /// Loads a JSON array of entries.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AgentErr> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, AgentErr> {
        let entries: Vec<FixtureEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    pub fn remaining(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LlmClient for FixtureClient {
    async fn stream(&self, _prompt: &Prompt) -> Result<ResponseStream, LlmError> {
        let next = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(entry) = next else {
            return Err(LlmError::other("fixture exhausted: no more scripted responses"));
        };
        debug!(?entry, "Streaming from fixture");

        match entry {
            FixtureEntry::Error { error, kind } => Err(LlmError {
                kind,
                message: error,
            }),
            FixtureEntry::Response { text, tool_calls } => {
                let mut events = Vec::new();
                if !text.is_empty() {
                    events.push(Ok(ResponseEvent::TextDelta(text.clone())));
                }
                for call in &tool_calls {
                    events.push(Ok(ResponseEvent::ToolCallDelta {
                        call_id: call.call_id.clone(),
                        tool_name: call.tool_name.clone(),
                    }));
                }
                events.push(Ok(ResponseEvent::Completed(LlmResponse { text, tool_calls })));
                Ok(ResponseStream::from_events(events))
            }
        }
    }
}
