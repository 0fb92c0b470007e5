//! A session owns the committed history and runs one turn at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::approval::ApprovalHandle;
use crate::client::LlmClient;
use crate::config::Config;
use crate::conversation_history::ConversationHistory;
use crate::error::AgentErr;
use crate::error::Result;
use crate::event_sink::EventSink;
use crate::models::ResponseItem;
use crate::models::ToolOutput;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::TurnState;
use crate::tool_spec::ToolSpec;
use crate::tool_spec::create_apply_patch_tool;
use crate::tools::ToolExecutor;
use crate::turn;

/// How a turn ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model replied with a final answer.
    Done { message: String },
    /// The step budget ran out while the model was still calling tools.
    MaxStepsReached,
}

#[derive(Default)]
struct State {
    history: ConversationHistory,
    turn_state: TurnState,
    busy: bool,
}

pub struct Session {
    pub(crate) client: Arc<dyn LlmClient>,
    pub(crate) tools: Arc<dyn ToolExecutor>,
    pub(crate) tool_specs: Vec<ToolSpec>,
    sink: Arc<dyn EventSink>,
    pub(crate) approvals: ApprovalGate,
    pub(crate) config: Config,
    state: Mutex<State>,
}

impl Session {
    pub fn new(
        config: Config,
        client: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolExecutor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut tool_specs = tools.specs();
        tool_specs.push(create_apply_patch_tool());
        Self {
            client,
            tools,
            tool_specs,
            sink,
            approvals: ApprovalGate::new(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for answering `patch_approval_request` events.
    pub fn approval_handle(&self) -> ApprovalHandle {
        self.approvals.handle()
    }

    /// Committed history, oldest first.
    pub fn history(&self) -> Vec<ResponseItem> {
        self.lock().history.contents()
    }

    pub fn turn_state(&self) -> TurnState {
        self.lock().turn_state
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_turn_state(&self, turn_state: TurnState) {
        tracing::debug!(?turn_state, "turn state");
        self.lock().turn_state = turn_state;
    }

    pub(crate) fn send_event(&self, turn_id: &str, msg: EventMsg) {
        self.sink.send(Event {
            id: turn_id.to_string(),
            msg,
        });
    }

    /// Drives one user request to a terminal state. The turn's items are
    /// committed to the history whatever the outcome; on failure an `error`
    /// event is emitted before the error is returned.
    pub async fn run_turn(
        &self,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let _busy = BusyGuard::acquire(self)?;
        let turn_id = Uuid::new_v4().to_string();
        info!(%turn_id, "turn started");

        let mut items = Vec::new();
        let result = turn::run_turn(self, &turn_id, input.into(), &cancel, &mut items).await;

        close_dangling_calls(&mut items);
        let terminal = match &result {
            Ok(TurnOutcome::Done { .. }) => TurnState::Done,
            Ok(TurnOutcome::MaxStepsReached) => TurnState::MaxStepsReached,
            Err(_) => TurnState::Error,
        };
        {
            let mut state = self.lock();
            state.history.record_items(items);
            state.turn_state = terminal;
        }

        match &result {
            Ok(outcome) => info!(%turn_id, ?outcome, "turn finished"),
            Err(e) => {
                warn!(%turn_id, "turn failed: {e}");
                self.send_event(
                    &turn_id,
                    EventMsg::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        result
    }
}

/// Marks the session busy for as long as it lives.
struct BusyGuard<'a> {
    sess: &'a Session,
}

impl<'a> BusyGuard<'a> {
    fn acquire(sess: &'a Session) -> Result<Self> {
        let mut state = sess.lock();
        if state.busy {
            return Err(AgentErr::TurnInProgress);
        }
        state.busy = true;
        Ok(Self { sess })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.sess.lock().busy = false;
    }
}

/// Gives every tool call without a result an `aborted` failure result, so
/// the committed history never has an unanswered call.
fn close_dangling_calls(items: &mut Vec<ResponseItem>) {
    let answered: HashSet<String> = items
        .iter()
        .filter_map(|item| match item {
            ResponseItem::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    let dangling: Vec<ResponseItem> = items
        .iter()
        .filter_map(|item| match item {
            ResponseItem::ToolCall { name, call_id, .. } if !answered.contains(call_id) => {
                Some(ResponseItem::ToolResult {
                    name: name.clone(),
                    call_id: call_id.clone(),
                    output: ToolOutput {
                        content: "aborted".to_string(),
                        success: false,
                    },
                })
            }
            _ => None,
        })
        .collect();
    items.extend(dangling);
}
