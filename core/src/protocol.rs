//! Defines the events a session emits while it drives a turn, plus the
//! policy labels shared between the engine and its front-ends.
//!
//! Events are fire-and-forget: the session never waits on a consumer.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Determines when a patch is escalated to the user for approval.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Ask only for patches the classifier flags (deletions).
    #[default]
    Auto,

    /// Ask for every patch, even ones classified safe.
    #[serde(alias = "always-ask")]
    AlwaysAsk,

    /// Never ask. Patches the classifier rejects are still rejected.
    #[serde(alias = "always-approve")]
    AlwaysApprove,
}

/// Label describing how shell commands should be confined. The engine only
/// forwards it to the executor; enforcement lives outside this crate.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SandboxPolicy {
    ReadOnly,
    #[default]
    WorkspaceWrite,
    DangerFullAccess,
}

/// Where the turn controller currently is. Exposed for observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Stepping {
        step: usize,
    },
    ToolExecuting {
        step: usize,
    },
    AwaitingApproval {
        step: usize,
    },
    Done,
    MaxStepsReached,
    Error,
}

/// Event Queue Entry - events from the agent
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    /// Turn id that this event is correlated with.
    pub id: String,
    /// Payload
    pub msg: EventMsg,
}

/// Progress of a turn. `step` is 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    /// Emitted right before a fatal error is returned to the caller.
    Error {
        message: String,
    },

    TurnStarted,

    /// The model is being queried for this step.
    AgentThinking {
        step: usize,
    },

    AgentTextDelta {
        step: usize,
        text: String,
    },

    /// Final free text of the turn.
    AgentTextDone {
        step: usize,
        message: String,
    },

    /// The model asked for one or more tool calls in this step.
    ToolPlanned {
        step: usize,
        message: String,
    },

    ToolStarted {
        step: usize,
        tool_name: String,
        call_id: String,
    },

    /// Output of a tool, truncated for display.
    ToolOutputDelta {
        step: usize,
        tool_name: String,
        message: String,
    },

    ToolFinished {
        step: usize,
        tool_name: String,
        call_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Answer with `ApprovalHandle::submit` using the same `request_id`.
    PatchApprovalRequest {
        step: usize,
        request_id: String,
        paths: Vec<PathBuf>,
        reason: String,
        /// What each hunk would do, in patch order, computed against the
        /// current tree.
        changes: Vec<PatchChange>,
    },

    PatchApprovalResult {
        step: usize,
        request_id: String,
        approved: bool,
    },

    TurnFinished {
        step: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Effect of one patch hunk on `path` (the path as written in the patch).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PatchChange {
    pub path: PathBuf,
    pub change: FileChange,
}

impl From<stepwise_apply_patch::PreviewedChange> for PatchChange {
    fn from(previewed: stepwise_apply_patch::PreviewedChange) -> Self {
        Self {
            path: previewed.path,
            change: previewed.change.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    Add {
        content: String,
    },
    Delete,
    Update {
        unified_diff: String,
        move_path: Option<PathBuf>,
    },
}

impl From<stepwise_apply_patch::ApplyPatchFileChange> for FileChange {
    fn from(change: stepwise_apply_patch::ApplyPatchFileChange) -> Self {
        use stepwise_apply_patch::ApplyPatchFileChange;
        match change {
            ApplyPatchFileChange::Add { content } => FileChange::Add { content },
            ApplyPatchFileChange::Delete => FileChange::Delete,
            ApplyPatchFileChange::Update {
                unified_diff,
                move_path,
                new_content: _,
            } => FileChange::Update {
                unified_diff,
                move_path,
            },
        }
    }
}
