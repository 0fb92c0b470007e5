//! Rendezvous between a running turn and whoever answers approval requests.
//!
//! The turn registers a waiter under a fresh request id, announces the
//! request through an event and blocks until a matching decision arrives or
//! the turn is cancelled. Decisions with an unknown id are dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ToolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub paths: Vec<PathBuf>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
}

struct PendingApproval {
    request: ApprovalRequest,
    tx_decision: oneshot::Sender<bool>,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<String, PendingApproval>,
    seq: u64,
}

/// Returned by [`ApprovalGate::register`]; pass it to [`ApprovalGate::wait`].
/// Dropping the waiter withdraws its request from the gate.
pub struct ApprovalWaiter {
    request_id: String,
    rx_decision: oneshot::Receiver<bool>,
    state: Arc<Mutex<GateState>>,
}

impl ApprovalWaiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for ApprovalWaiter {
    fn drop(&mut self) {
        let withdrawn = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&self.request_id);
        if withdrawn.is_some() {
            debug!(request_id = %self.request_id, "approval request withdrawn");
        }
    }
}

#[derive(Clone, Default)]
pub struct ApprovalGate {
    state: Arc<Mutex<GateState>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `{unix millis}-{step}-{seq}`. The sequence number makes ids unique
    /// within the gate even when the clock does not move.
    pub fn next_request_id(&self, step: usize) -> String {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let mut state = self.lock();
        state.seq += 1;
        format!("{millis}-{step}-{}", state.seq)
    }

    pub fn register(&self, request: ApprovalRequest) -> ApprovalWaiter {
        let (tx_decision, rx_decision) = oneshot::channel();
        let request_id = request.request_id.clone();
        self.lock().pending.insert(
            request_id.clone(),
            PendingApproval {
                request,
                tx_decision,
            },
        );
        ApprovalWaiter {
            request_id,
            rx_decision,
            state: Arc::clone(&self.state),
        }
    }

    /// Blocks until the request is decided. A waiter whose sender went away
    /// without a decision counts as denied. The request leaves the pending
    /// set however this returns, including when the future is dropped.
    pub async fn wait(
        &self,
        mut waiter: ApprovalWaiter,
        cancel: &CancellationToken,
    ) -> Result<bool, ToolError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            decision = &mut waiter.rx_decision => Ok(decision.unwrap_or(false)),
        }
    }

    /// Resolves the matching waiter. Returns `false` when no request with
    /// that id is pending.
    pub fn submit(&self, decision: ApprovalDecision) -> bool {
        let pending = self.lock().pending.remove(&decision.request_id);
        match pending {
            Some(pending) => {
                debug!(
                    request_id = %decision.request_id,
                    approved = decision.approved,
                    "approval decision received"
                );
                pending.tx_decision.send(decision.approved).is_ok()
            }
            None => {
                debug!(
                    request_id = %decision.request_id,
                    "discarding approval decision with no pending request"
                );
                false
            }
        }
    }

    /// Outstanding requests, oldest first.
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .lock()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| request_seq(&r.request_id));
        requests
    }

    pub fn handle(&self) -> ApprovalHandle {
        ApprovalHandle { gate: self.clone() }
    }
}

fn request_seq(request_id: &str) -> u64 {
    request_id
        .rsplit('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(u64::MAX)
}

/// What external actors (a terminal prompt, a UI) hold to answer requests.
#[derive(Clone)]
pub struct ApprovalHandle {
    gate: ApprovalGate,
}

impl ApprovalHandle {
    pub fn submit(&self, decision: ApprovalDecision) -> bool {
        self.gate.submit(decision)
    }

    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.gate.pending_requests()
    }
}
