//! The step loop of a single turn.
//!
//! Each step asks the model once and runs the calls it requested, in order.
//! Tool failures are handed back to the model as results; only LLM failures
//! and cancellation end the turn early.

use futures::StreamExt;
use stepwise_apply_patch::MaybeApplyPatch;
use stepwise_apply_patch::Patch;
use stepwise_apply_patch::apply_patch_in_dir;
use stepwise_apply_patch::maybe_parse_apply_patch;
use stepwise_apply_patch::parse_patch;
use stepwise_apply_patch::preview_patch;
use stepwise_apply_patch::print_summary;
use stepwise_apply_patch::summarize_patch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::approval::ApprovalRequest;
use crate::client_common::LlmResponse;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::error::AgentErr;
use crate::error::LlmError;
use crate::error::Result;
use crate::error::ToolError;
use crate::models::ApplyPatchParams;
use crate::models::ResponseItem;
use crate::models::ShellToolCallParams;
use crate::models::ToolCall;
use crate::models::ToolOutput;
use crate::protocol::EventMsg;
use crate::protocol::TurnState;
use crate::safety::PatchSafetyDecision;
use crate::safety::SafetyLevel;
use crate::safety::assess_patch_safety;
use crate::session::Session;
use crate::session::TurnOutcome;
use crate::tool_resolver::ToolCallResolver;
use crate::tools::ToolContext;
use crate::tools::parse_arguments;
use crate::util::truncate_for_display;

/// Tool output shown in `tool_output_delta` events is capped at this size.
/// The model always receives the full output.
const MAX_DISPLAY_OUTPUT_BYTES: usize = 5 * 1024;

/// Runs the steps of one turn. Items produced so far are left in `items`
/// even when an error is returned, so the caller can commit them.
pub(crate) async fn run_turn(
    sess: &Session,
    turn_id: &str,
    input: String,
    cancel: &CancellationToken,
    items: &mut Vec<ResponseItem>,
) -> Result<TurnOutcome> {
    let max_steps = sess.config.max_steps;
    let ctx = ToolContext {
        cwd: sess.config.cwd.clone(),
        sandbox_policy: sess.config.sandbox_policy,
        cancel: cancel.clone(),
        default_timeout: sess.config.shell_timeout,
    };
    let mut resolver = ToolCallResolver::new();

    items.push(ResponseItem::user_message(input));
    sess.send_event(turn_id, EventMsg::TurnStarted);

    for step in 1..=max_steps {
        sess.set_turn_state(TurnState::Stepping { step });
        sess.send_event(turn_id, EventMsg::AgentThinking { step });

        let mut input = sess.history();
        input.extend(items.iter().cloned());
        let prompt = Prompt {
            input,
            user_instructions: sess.config.user_instructions.clone(),
            tools: sess.tool_specs.clone(),
        };

        let response = stream_response(sess, turn_id, step, &prompt, cancel).await?;
        let calls = resolver.resolve(&response, step);

        // A free-text reply that parsed as tool calls is recorded only as
        // those calls.
        let text_is_call = response.tool_calls.is_empty() && !calls.is_empty();
        if !response.text.is_empty() && !text_is_call {
            items.push(ResponseItem::assistant_message(response.text.clone()));
        }

        if calls.is_empty() {
            sess.send_event(
                turn_id,
                EventMsg::AgentTextDone {
                    step,
                    message: response.text.clone(),
                },
            );
            sess.send_event(turn_id, EventMsg::TurnFinished { step, message: None });
            return Ok(TurnOutcome::Done {
                message: response.text,
            });
        }

        items.extend(calls.iter().map(|call| ResponseItem::ToolCall {
            name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            call_id: call.call_id.clone(),
        }));
        let names: Vec<&str> = calls.iter().map(|c| c.tool_name.as_str()).collect();
        sess.send_event(
            turn_id,
            EventMsg::ToolPlanned {
                step,
                message: format!("calling {}", names.join(", ")),
            },
        );

        for call in &calls {
            let output = execute_call(sess, turn_id, step, call, &ctx).await?;
            items.push(ResponseItem::ToolResult {
                name: call.tool_name.clone(),
                call_id: call.call_id.clone(),
                output,
            });
            if cancel.is_cancelled() {
                return Err(AgentErr::Interrupted);
            }
        }
    }

    sess.send_event(
        turn_id,
        EventMsg::TurnFinished {
            step: max_steps,
            message: Some(format!(
                "stopped after reaching the maximum of {max_steps} steps"
            )),
        },
    );
    Ok(TurnOutcome::MaxStepsReached)
}

/// Streams one model call, forwarding text deltas as they arrive.
async fn stream_response(
    sess: &Session,
    turn_id: &str,
    step: usize,
    prompt: &Prompt,
    cancel: &CancellationToken,
) -> Result<LlmResponse> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AgentErr::Interrupted),
        stream = sess.client.stream(prompt) => stream,
    };
    let mut stream = stream.map_err(log_llm_error)?;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentErr::Interrupted),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(ResponseEvent::TextDelta(text))) => {
                sess.send_event(turn_id, EventMsg::AgentTextDelta { step, text });
            }
            Some(Ok(ResponseEvent::ToolCallDelta { call_id, tool_name })) => {
                trace!(?call_id, %tool_name, "tool call delta");
            }
            Some(Ok(ResponseEvent::Completed(response))) => return Ok(response),
            Some(Err(e)) => return Err(log_llm_error(e)),
            None => {
                return Err(log_llm_error(LlmError::network(
                    "stream closed before response.completed",
                )));
            }
        }
    }
}

fn log_llm_error(e: LlmError) -> AgentErr {
    warn!(kind = %e.kind, "llm call failed: {}", e.message);
    AgentErr::from(e)
}

/// Runs one call and reports it through events. Tool failures come back as
/// a failed `ToolOutput`; only cancellation is returned as an error.
async fn execute_call(
    sess: &Session,
    turn_id: &str,
    step: usize,
    call: &ToolCall,
    ctx: &ToolContext,
) -> Result<ToolOutput> {
    sess.set_turn_state(TurnState::ToolExecuting { step });
    sess.send_event(
        turn_id,
        EventMsg::ToolStarted {
            step,
            tool_name: call.tool_name.clone(),
            call_id: call.call_id.clone(),
        },
    );

    let result = match as_apply_patch(call) {
        Some(Ok(patch)) => handle_apply_patch(sess, turn_id, step, patch, ctx).await,
        Some(Err(e)) => Err(e),
        None => sess.tools.execute(call, ctx).await,
    };
    let output = match result {
        Ok(output) => output,
        Err(ToolError::Cancelled) => return Err(AgentErr::Interrupted),
        Err(e) => {
            debug!(tool = %call.tool_name, "tool call failed: {e}");
            ToolOutput {
                content: e.to_string(),
                success: false,
            }
        }
    };

    sess.send_event(
        turn_id,
        EventMsg::ToolOutputDelta {
            step,
            tool_name: call.tool_name.clone(),
            message: truncate_for_display(&output.content, MAX_DISPLAY_OUTPUT_BYTES),
        },
    );
    sess.send_event(
        turn_id,
        EventMsg::ToolFinished {
            step,
            tool_name: call.tool_name.clone(),
            call_id: call.call_id.clone(),
            success: output.success,
            message: (!output.success)
                .then(|| truncate_for_display(&output.content, MAX_DISPLAY_OUTPUT_BYTES)),
        },
    );
    Ok(output)
}

/// Returns the patch when `call` edits files: either the `apply_patch` tool
/// or a `shell` call that invokes `apply_patch`.
fn as_apply_patch(call: &ToolCall) -> Option<std::result::Result<Patch, ToolError>> {
    match call.tool_name.as_str() {
        "apply_patch" => Some(
            parse_arguments::<ApplyPatchParams>(call)
                .and_then(|params| parse_patch(&params.input).map_err(ToolError::from)),
        ),
        "shell" => {
            let params = parse_arguments::<ShellToolCallParams>(call).ok()?;
            match maybe_parse_apply_patch(&params.command) {
                MaybeApplyPatch::Body(patch) => Some(Ok(patch)),
                MaybeApplyPatch::PatchParseError(e) => Some(Err(ToolError::from(e))),
                MaybeApplyPatch::ShellParseError(e) => Some(Err(ToolError::InvalidArguments(
                    format!("failed to parse apply_patch invocation: {e}"),
                ))),
                MaybeApplyPatch::NotApplyPatch => None,
            }
        }
        _ => None,
    }
}

/// Classifies the patch, asks for approval when needed and applies it.
async fn handle_apply_patch(
    sess: &Session,
    turn_id: &str,
    step: usize,
    patch: Patch,
    ctx: &ToolContext,
) -> std::result::Result<ToolOutput, ToolError> {
    let summary = summarize_patch(&patch);
    let decision = assess_patch_safety(
        &summary,
        sess.config.approval_policy,
        &sess.config.protected_paths,
    );
    debug!(level = %decision.level, reason = %decision.reason, "patch classified");

    match decision.level {
        SafetyLevel::Reject => {
            return Err(ToolError::Rejected {
                reason: decision.reason,
            });
        }
        SafetyLevel::Safe => {}
        SafetyLevel::AskUser => {
            let approved = request_approval(sess, turn_id, step, &patch, decision, ctx).await?;
            if !approved {
                return Err(ToolError::Rejected {
                    reason: "declined by user".to_string(),
                });
            }
        }
    }

    let result = apply_patch_in_dir(&patch, &ctx.cwd)?;
    let mut stdout = Vec::new();
    print_summary(&result.summary, &mut stdout)
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    Ok(ToolOutput {
        content: String::from_utf8_lossy(&stdout).into_owned(),
        success: true,
    })
}

async fn request_approval(
    sess: &Session,
    turn_id: &str,
    step: usize,
    patch: &Patch,
    decision: PatchSafetyDecision,
    ctx: &ToolContext,
) -> std::result::Result<bool, ToolError> {
    // A patch that cannot apply to the current tree is refused before anyone
    // is asked about it.
    let changes = preview_patch(patch, &ctx.cwd)?;

    let request_id = sess.approvals.next_request_id(step);
    let waiter = sess.approvals.register(ApprovalRequest {
        request_id: request_id.clone(),
        paths: decision.paths.clone(),
        reason: decision.reason.clone(),
    });
    sess.set_turn_state(TurnState::AwaitingApproval { step });
    sess.send_event(
        turn_id,
        EventMsg::PatchApprovalRequest {
            step,
            request_id: request_id.clone(),
            paths: decision.paths,
            reason: decision.reason,
            changes: changes.into_iter().map(Into::into).collect(),
        },
    );

    let approved = sess.approvals.wait(waiter, &ctx.cancel).await?;
    sess.send_event(
        turn_id,
        EventMsg::PatchApprovalResult {
            step,
            request_id,
            approved,
        },
    );
    sess.set_turn_state(TurnState::ToolExecuting { step });
    Ok(approved)
}
