#![allow(clippy::expect_used, clippy::unwrap_used)]

// Helpers shared by the integration tests. These are located inside the
// `tests/` tree on purpose so they never become part of the public API surface
// of the `stepwise-core` crate.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use stepwise_core::LlmClient;
use stepwise_core::LlmResponse;
use stepwise_core::Prompt;
use stepwise_core::ResponseEvent;
use stepwise_core::ResponseStream;
use stepwise_core::config::Config;
use stepwise_core::config::ConfigOverrides;
use stepwise_core::config::ConfigToml;
use stepwise_core::error::LlmError;
use stepwise_core::event_sink::EventSink;
use stepwise_core::models::LlmToolCall;
use stepwise_core::protocol::Event;
use stepwise_core::protocol::EventMsg;

/// Returns a default `Config` whose on-disk state is confined to the provided
/// temporary directory, with `cwd` as the working directory.
pub fn load_default_config_for_test(stepwise_home: &TempDir, cwd: &Path) -> Config {
    Config::load_from_base_config_with_overrides(
        ConfigToml::default(),
        ConfigOverrides {
            cwd: Some(cwd.to_path_buf()),
            ..Default::default()
        },
        stepwise_home.path().to_path_buf(),
    )
    .expect("defaults for test should always succeed")
}

enum Script {
    Respond(LlmResponse),
    Fail(LlmError),
    /// A stream that never yields.
    Hang,
}

/// LLM client that plays back a script, one entry per call. Once the script
/// runs out the last entry is repeated.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    prompts: Mutex<Vec<Prompt>>,
    // Keeps hanging streams open.
    hung: Mutex<Vec<mpsc::Sender<Result<ResponseEvent, LlmError>>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, text: &str) -> Self {
        self.push(Script::Respond(LlmResponse {
            text: text.to_string(),
            tool_calls: Vec::new(),
        }))
    }

    /// One structured call without a call id.
    pub fn tool_call(self, tool_name: &str, arguments: serde_json::Value) -> Self {
        self.tool_calls(vec![(tool_name, arguments)])
    }

    pub fn tool_calls(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        let tool_calls = calls
            .into_iter()
            .map(|(tool_name, arguments)| LlmToolCall {
                tool_name: tool_name.to_string(),
                arguments,
                call_id: None,
            })
            .collect();
        self.push(Script::Respond(LlmResponse {
            text: String::new(),
            tool_calls,
        }))
    }

    pub fn fail(self, error: LlmError) -> Self {
        self.push(Script::Fail(error))
    }

    pub fn hang(self) -> Self {
        self.push(Script::Hang)
    }

    fn push(self, entry: Script) -> Self {
        self.script.lock().unwrap().push_back(entry);
        self
    }

    /// Number of model calls made so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_entry(&self) -> Script {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(entry) => {
                *last = Some(clone_script(&entry));
                entry
            }
            None => last.as_ref().map(clone_script).unwrap_or(Script::Hang),
        }
    }
}

fn clone_script(script: &Script) -> Script {
    match script {
        Script::Respond(response) => Script::Respond(response.clone()),
        Script::Fail(error) => Script::Fail(error.clone()),
        Script::Hang => Script::Hang,
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream, LlmError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        match self.next_entry() {
            Script::Respond(response) => {
                let mut events = Vec::new();
                if !response.text.is_empty() {
                    events.push(Ok(ResponseEvent::TextDelta(response.text.clone())));
                }
                events.push(Ok(ResponseEvent::Completed(response)));
                Ok(ResponseStream::from_events(events))
            }
            Script::Fail(error) => Err(error),
            Script::Hang => {
                let (tx, rx) = mpsc::channel(1);
                self.hung.lock().unwrap().push(tx);
                Ok(ResponseStream::new(rx))
            }
        }
    }
}

/// Unbounded event channel usable as a session sink.
pub fn event_channel() -> (Arc<dyn EventSink>, async_channel::Receiver<Event>) {
    let (tx, rx) = async_channel::unbounded();
    (Arc::new(tx), rx)
}

/// Waits (up to five seconds) for the first event matching `predicate`.
pub async fn wait_for_event<F>(rx: &async_channel::Receiver<Event>, mut predicate: F) -> EventMsg
where
    F: FnMut(&EventMsg) -> bool,
{
    use tokio::time::Duration;
    use tokio::time::timeout;
    loop {
        let ev = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended unexpectedly");
        if predicate(&ev.msg) {
            return ev.msg;
        }
    }
}

/// Everything already queued on `rx`.
pub fn drain_events(rx: &async_channel::Receiver<Event>) -> Vec<EventMsg> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev.msg);
    }
    events
}
