#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use core_test_support::ScriptedClient;
use core_test_support::drain_events;
use core_test_support::event_channel;
use core_test_support::load_default_config_for_test;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use serde_json::json;
use stepwise_core::Session;
use stepwise_core::TurnOutcome;
use stepwise_core::approval::ApprovalDecision;
use stepwise_core::config::Config;
use stepwise_core::error::AgentErr;
use stepwise_core::error::LlmError;
use stepwise_core::models::ResponseItem;
use stepwise_core::models::ToolOutput;
use stepwise_core::protocol::ApprovalPolicy;
use stepwise_core::protocol::EventMsg;
use stepwise_core::protocol::FileChange;
use stepwise_core::protocol::PatchChange;
use stepwise_core::protocol::TurnState;
use stepwise_core::tools::ToolRegistry;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    _home: TempDir,
    workspace: TempDir,
    client: Arc<ScriptedClient>,
    session: Arc<Session>,
    events: async_channel::Receiver<stepwise_core::protocol::Event>,
}

fn harness_with(client: ScriptedClient, configure: impl FnOnce(&mut Config)) -> Harness {
    let home = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let mut config = load_default_config_for_test(&home, workspace.path());
    configure(&mut config);
    let client = Arc::new(client);
    let (sink, events) = event_channel();
    let session = Arc::new(Session::new(
        config,
        client.clone(),
        Arc::new(ToolRegistry::with_builtin_tools()),
        sink,
    ));
    Harness {
        _home: home,
        workspace,
        client,
        session,
        events,
    }
}

fn harness(client: ScriptedClient) -> Harness {
    harness_with(client, |_| {})
}

fn tool_results(history: &[ResponseItem]) -> Vec<ToolOutput> {
    history
        .iter()
        .filter_map(|item| match item {
            ResponseItem::ToolResult { output, .. } => Some(output.clone()),
            _ => None,
        })
        .collect()
}

const DELETE_SECRETS: &str = "*** Begin Patch\n*** Delete File: secrets.env\n*** End Patch";

#[tokio::test]
async fn final_answer_ends_the_turn() {
    let h = harness(ScriptedClient::new().text("All good."));

    let outcome = h
        .session
        .run_turn("check the build", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Done {
            message: "All good.".to_string()
        }
    );
    assert_eq!(
        drain_events(&h.events),
        vec![
            EventMsg::TurnStarted,
            EventMsg::AgentThinking { step: 1 },
            EventMsg::AgentTextDelta {
                step: 1,
                text: "All good.".to_string()
            },
            EventMsg::AgentTextDone {
                step: 1,
                message: "All good.".to_string()
            },
            EventMsg::TurnFinished {
                step: 1,
                message: None
            },
        ]
    );
    assert_eq!(
        h.session.history(),
        vec![
            ResponseItem::user_message("check the build"),
            ResponseItem::assistant_message("All good."),
        ]
    );
    assert_eq!(h.session.turn_state(), TurnState::Done);
}

#[tokio::test]
async fn turn_loop_stops_at_max_steps() {
    let h = harness_with(
        ScriptedClient::new().tool_call("read_file", json!({"path": "missing.txt"})),
        |config| config.max_steps = 3,
    );

    let outcome = h
        .session
        .run_turn("loop forever", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::MaxStepsReached);
    assert_eq!(h.client.calls(), 3);
    let events = drain_events(&h.events);
    assert_eq!(
        events.last(),
        Some(&EventMsg::TurnFinished {
            step: 3,
            message: Some("stopped after reaching the maximum of 3 steps".to_string()),
        })
    );

    // Every call has a result, each with a distinct id.
    let history = h.session.history();
    let ids: Vec<String> = history
        .iter()
        .filter_map(|item| match item {
            ResponseItem::ToolCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["1-0", "2-0", "3-0"]);
    assert_eq!(tool_results(&history).len(), 3);
    assert_eq!(h.session.turn_state(), TurnState::MaxStepsReached);
}

#[tokio::test]
async fn free_text_tool_call_is_executed_then_answered() {
    let h = harness(
        ScriptedClient::new()
            .text(r#"{"tool_name": "read_file", "arguments": {"path": "notes.txt"}}"#)
            .text("The notes say hello."),
    );
    std::fs::write(h.workspace.path().join("notes.txt"), "hello\n").unwrap();

    let outcome = h
        .session
        .run_turn("what do the notes say?", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Done {
            message: "The notes say hello.".to_string()
        }
    );
    let history = h.session.history();
    assert_eq!(
        history[1],
        ResponseItem::ToolCall {
            name: "read_file".to_string(),
            arguments: json!({"path": "notes.txt"}),
            call_id: "1-0".to_string(),
        }
    );
    assert_eq!(
        tool_results(&history),
        vec![ToolOutput {
            content: "     1\thello".to_string(),
            success: true,
        }]
    );

    // The second model call saw the tool result.
    let second_prompt = &h.client.prompts()[1];
    assert!(matches!(
        second_prompt.input.last(),
        Some(ResponseItem::ToolResult { .. })
    ));
}

#[tokio::test]
async fn tool_failures_are_reported_to_the_model() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("frobnicate", json!({}))
            .text("I cannot do that."),
    );

    let outcome = h
        .session
        .run_turn("frobnicate", CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Done { .. }));
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "unsupported call: frobnicate".to_string(),
            success: false,
        }]
    );
    let finished = drain_events(&h.events)
        .into_iter()
        .find(|ev| matches!(ev, EventMsg::ToolFinished { .. }))
        .unwrap();
    assert_eq!(
        finished,
        EventMsg::ToolFinished {
            step: 1,
            tool_name: "frobnicate".to_string(),
            call_id: "1-0".to_string(),
            success: false,
            message: Some("unsupported call: frobnicate".to_string()),
        }
    );
}

#[tokio::test]
async fn safe_patch_is_applied_without_asking() {
    let patch = "*** Begin Patch\n*** Add File: hello.txt\n+hi\n*** End Patch";
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": patch}))
            .text("Added hello.txt."),
    );

    h.session
        .run_turn("add a greeting", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(h.workspace.path().join("hello.txt")).unwrap(),
        "hi\n"
    );
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "Success. Updated the following files:\nA hello.txt\n".to_string(),
            success: true,
        }]
    );
    assert!(
        !drain_events(&h.events)
            .iter()
            .any(|ev| matches!(ev, EventMsg::PatchApprovalRequest { .. }))
    );
}

#[tokio::test]
async fn shell_heredoc_apply_patch_is_intercepted() {
    let script = "apply_patch <<'EOF'\n*** Begin Patch\n*** Update File: a.txt\n@@\n-old\n+new\n*** End Patch\nEOF\n";
    let h = harness(
        ScriptedClient::new()
            .tool_call("shell", json!({"command": ["bash", "-lc", script]}))
            .text("Updated."),
    );
    std::fs::write(h.workspace.path().join("a.txt"), "old\n").unwrap();

    h.session
        .run_turn("update a.txt", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(h.workspace.path().join("a.txt")).unwrap(),
        "new\n"
    );
}

#[tokio::test]
async fn malformed_patch_is_a_recorded_failure() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": "*** Begin Patch\n*** End Patch"}))
            .text("Sorry."),
    );

    h.session
        .run_turn("patch it", CancellationToken::new())
        .await
        .unwrap();

    let results = tool_results(&h.session.history());
    assert!(!results[0].success);
    assert!(results[0].content.starts_with("failed to "));
}

#[tokio::test]
async fn denied_deletion_leaves_file_untouched() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": DELETE_SECRETS}))
            .text("Left secrets.env alone."),
    );
    let secrets = h.workspace.path().join("secrets.env");
    std::fs::write(&secrets, "TOKEN=1\n").unwrap();

    let approvals = h.session.approval_handle();
    let events = h.events.clone();
    let approver = async move {
        let request = wait_for_event(&events, |ev| {
            matches!(ev, EventMsg::PatchApprovalRequest { .. })
        })
        .await;
        let EventMsg::PatchApprovalRequest {
            request_id,
            paths,
            reason,
            changes,
            ..
        } = request
        else {
            unreachable!()
        };
        assert_eq!(paths, vec![PathBuf::from("secrets.env")]);
        assert_eq!(reason, "contains file deletion");
        assert_eq!(changes.len(), 1);
        assert!(approvals.submit(ApprovalDecision {
            request_id,
            approved: false,
        }));
    };

    let (outcome, ()) = tokio::join!(
        h.session.run_turn("remove secrets", CancellationToken::new()),
        approver
    );

    assert!(matches!(outcome.unwrap(), TurnOutcome::Done { .. }));
    assert!(secrets.exists());
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "patch rejected: declined by user".to_string(),
            success: false,
        }]
    );
    assert!(
        drain_events(&h.events)
            .iter()
            .any(|ev| matches!(ev, EventMsg::PatchApprovalResult { approved: false, .. }))
    );
}

#[tokio::test]
async fn mismatched_decision_is_ignored_until_the_right_one_arrives() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": DELETE_SECRETS}))
            .text("Deleted."),
    );
    let secrets = h.workspace.path().join("secrets.env");
    std::fs::write(&secrets, "TOKEN=1\n").unwrap();

    let approvals = h.session.approval_handle();
    let events = h.events.clone();
    let approver = async move {
        let request = wait_for_event(&events, |ev| {
            matches!(ev, EventMsg::PatchApprovalRequest { .. })
        })
        .await;
        let EventMsg::PatchApprovalRequest { request_id, .. } = request else {
            unreachable!()
        };
        assert!(!approvals.submit(ApprovalDecision {
            request_id: format!("{request_id}-stale"),
            approved: true,
        }));
        assert_eq!(approvals.pending_requests().len(), 1);
        assert!(approvals.submit(ApprovalDecision {
            request_id,
            approved: true,
        }));
    };

    let (outcome, ()) = tokio::join!(
        h.session.run_turn("remove secrets", CancellationToken::new()),
        approver
    );

    outcome.unwrap();
    assert!(!secrets.exists());
}

#[tokio::test]
async fn cancellation_during_approval_aborts_the_turn() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": DELETE_SECRETS}))
            .text("unreachable"),
    );
    let secrets = h.workspace.path().join("secrets.env");
    std::fs::write(&secrets, "TOKEN=1\n").unwrap();

    let cancel = CancellationToken::new();
    let events = h.events.clone();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            wait_for_event(&events, |ev| {
                matches!(ev, EventMsg::PatchApprovalRequest { .. })
            })
            .await;
            cancel.cancel();
        }
    };

    let (outcome, ()) = tokio::join!(h.session.run_turn("remove secrets", cancel), canceller);

    assert!(matches!(outcome, Err(AgentErr::Interrupted)));
    assert!(secrets.exists());
    assert_eq!(h.client.calls(), 1);
    assert!(h.session.approval_handle().pending_requests().is_empty());
    // The dangling call is closed in the committed history.
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "aborted".to_string(),
            success: false,
        }]
    );
    assert_eq!(h.session.turn_state(), TurnState::Error);
    assert!(
        drain_events(&h.events)
            .iter()
            .any(|ev| matches!(ev, EventMsg::Error { .. }))
    );
}

#[tokio::test]
async fn dropping_the_turn_withdraws_its_approval_request() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": DELETE_SECRETS}))
            .text("unreachable"),
    );
    let secrets = h.workspace.path().join("secrets.env");
    std::fs::write(&secrets, "TOKEN=1\n").unwrap();
    let approvals = h.session.approval_handle();

    let request_id = tokio::select! {
        _ = h.session.run_turn("remove secrets", CancellationToken::new()) => {
            panic!("turn finished without asking for approval")
        }
        msg = wait_for_event(&h.events, |ev| {
            matches!(ev, EventMsg::PatchApprovalRequest { .. })
        }) => match msg {
            EventMsg::PatchApprovalRequest { request_id, .. } => request_id,
            other => panic!("unexpected event {other:?}"),
        },
    };

    assert!(approvals.pending_requests().is_empty());
    assert!(!approvals.submit(ApprovalDecision {
        request_id,
        approved: true,
    }));
    assert!(secrets.exists());
}

#[tokio::test]
async fn cancellation_during_llm_stream_interrupts() {
    let h = harness(ScriptedClient::new().hang());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let err = h.session.run_turn("hello", cancel).await.unwrap_err();

    assert!(matches!(err, AgentErr::Interrupted));
    assert_eq!(
        h.session.history(),
        vec![ResponseItem::user_message("hello")]
    );
}

#[tokio::test]
async fn second_turn_while_busy_is_refused() {
    let h = harness(ScriptedClient::new().hang());
    let cancel = CancellationToken::new();

    let running = {
        let session = Arc::clone(&h.session);
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run_turn("first", cancel).await })
    };
    wait_for_event(&h.events, |ev| matches!(ev, EventMsg::AgentThinking { .. })).await;

    let err = h
        .session
        .run_turn("second", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentErr::TurnInProgress));

    cancel.cancel();
    let first = running.await.unwrap();
    assert!(matches!(first, Err(AgentErr::Interrupted)));

    // The session accepts turns again once the first one ended.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let third = h.session.run_turn("third", cancelled).await;
    assert!(matches!(third, Err(AgentErr::Interrupted)));
}

#[tokio::test]
async fn llm_failure_is_fatal_and_items_are_committed() {
    let h = harness(
        ScriptedClient::new()
            .tool_call("read_file", json!({"path": "missing.txt"}))
            .fail(LlmError::network("connection reset")),
    );

    let err = h
        .session
        .run_turn("read it", CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "llm error (network): connection reset");
    let history = h.session.history();
    assert_eq!(history.len(), 3);
    assert_eq!(tool_results(&history).len(), 1);
    let events = drain_events(&h.events);
    assert_eq!(
        events.last(),
        Some(&EventMsg::Error {
            message: "llm error (network): connection reset".to_string()
        })
    );
}

#[tokio::test]
async fn protected_paths_are_rejected_without_asking() {
    let h = harness_with(
        ScriptedClient::new()
            .tool_call(
                "apply_patch",
                json!({"input": "*** Begin Patch\n*** Add File: .git/config\n+x\n*** End Patch"}),
            )
            .text("ok"),
        |config| config.protected_paths = vec![".git/*".to_string()],
    );

    h.session
        .run_turn("touch git", CancellationToken::new())
        .await
        .unwrap();

    assert!(!h.workspace.path().join(".git/config").exists());
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "patch rejected: touches protected path .git/config".to_string(),
            success: false,
        }]
    );
}

#[tokio::test]
async fn approval_preview_sees_earlier_hunks_of_the_patch() {
    let patch = "*** Begin Patch\n\
                 *** Add File: new.txt\n\
                 +a\n\
                 *** Update File: new.txt\n\
                 @@\n\
                 -a\n\
                 +b\n\
                 *** End Patch";
    let h = harness_with(
        ScriptedClient::new()
            .tool_call("apply_patch", json!({"input": patch}))
            .text("Wrote new.txt."),
        |config| config.approval_policy = ApprovalPolicy::AlwaysAsk,
    );

    let approvals = h.session.approval_handle();
    let events = h.events.clone();
    let approver = async move {
        let request = wait_for_event(&events, |ev| {
            matches!(ev, EventMsg::PatchApprovalRequest { .. })
        })
        .await;
        let EventMsg::PatchApprovalRequest {
            request_id,
            changes,
            ..
        } = request
        else {
            unreachable!()
        };
        assert_eq!(
            changes,
            vec![
                PatchChange {
                    path: PathBuf::from("new.txt"),
                    change: FileChange::Add {
                        content: "a\n".to_string()
                    },
                },
                PatchChange {
                    path: PathBuf::from("new.txt"),
                    change: FileChange::Update {
                        unified_diff: "@@ -1 +1 @@\n-a\n+b\n".to_string(),
                        move_path: None,
                    },
                },
            ]
        );
        assert!(approvals.submit(ApprovalDecision {
            request_id,
            approved: true,
        }));
    };

    let (outcome, ()) = tokio::join!(
        h.session.run_turn("write new.txt", CancellationToken::new()),
        approver
    );

    outcome.unwrap();
    assert_eq!(
        std::fs::read_to_string(h.workspace.path().join("new.txt")).unwrap(),
        "b\n"
    );
    assert_eq!(
        tool_results(&h.session.history()),
        vec![ToolOutput {
            content: "Success. Updated the following files:\nA new.txt\nM new.txt\n".to_string(),
            success: true,
        }]
    );
}

#[tokio::test]
async fn calls_in_one_step_run_in_order_with_distinct_ids() {
    let add_x = "*** Begin Patch\n*** Add File: x.txt\n+from the patch\n*** End Patch";
    let h = harness(
        ScriptedClient::new()
            .tool_calls(vec![
                ("apply_patch", json!({"input": add_x})),
                ("read_file", json!({"path": "x.txt"})),
            ])
            .text("x.txt is in place."),
    );

    h.session
        .run_turn("create and check x.txt", CancellationToken::new())
        .await
        .unwrap();

    let history = h.session.history();
    let shape: Vec<(&str, &str)> = history
        .iter()
        .filter_map(|item| match item {
            ResponseItem::ToolCall { call_id, .. } => Some(("call", call_id.as_str())),
            ResponseItem::ToolResult { call_id, .. } => Some(("result", call_id.as_str())),
            ResponseItem::Message { .. } => None,
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            ("call", "1-0"),
            ("call", "1-1"),
            ("result", "1-0"),
            ("result", "1-1"),
        ]
    );

    let results = tool_results(&history);
    assert!(results.iter().all(|output| output.success), "{results:?}");
    assert!(
        results[1].content.contains("from the patch"),
        "{}",
        results[1].content
    );
}
