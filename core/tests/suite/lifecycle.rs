use pretty_assertions::assert_eq;
use serde_json::json;
use warden_protocol::DenyCode;
use warden_protocol::SessionState;
use warden_protocol::TurnOutcome;

use crate::suite::common::TestHarness;
use crate::suite::common::replay_event_kinds;

#[tokio::test]
async fn mutation_verb_on_fresh_session_is_scope_denied() {
    let harness = TestHarness::new().await;
    let envelope = harness
        .turn(
            "apply_code_patch",
            json!({
                "nodeId": "c1",
                "targetFile": "src/target.ts",
                "operation": "replace_text",
                "find": "a",
                "replace": "b"
            }),
        )
        .await;

    assert_eq!(envelope.state, SessionState::Uninitialized);
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanCapabilityScope));
    assert_eq!(envelope.progress.total, 0);
    assert_eq!(envelope.outcome, Some(TurnOutcome::Denied));
    // The envelope still tells the agent what it may do.
    assert_eq!(envelope.capabilities, vec!["initialize_work".to_string()]);
}

#[tokio::test]
async fn unknown_verb_is_scope_denied_inside_an_envelope() {
    let harness = TestHarness::new().await;
    let envelope = harness.turn("drop_database", json!({})).await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanCapabilityScope));
    assert_eq!(envelope.state, SessionState::Uninitialized);
}

#[tokio::test]
async fn initialize_then_out_of_pack_read_is_denied_and_logged() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    assert_eq!(init.state, SessionState::Planning);

    let pack_before = std::fs::read_to_string(harness.pack_path()).expect("pack on disk");

    let envelope = harness
        .turn("read_file_lines", json!({"file": "not/in/pack.ts"}))
        .await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PackScopeViolation));

    // The pack file list is untouched by a denied read.
    let pack_after = std::fs::read_to_string(harness.pack_path()).expect("pack on disk");
    assert_eq!(pack_before, pack_after);

    // Both turns produced input and output envelopes.
    harness.settle_events().await;
    let kinds = replay_event_kinds(&harness.config.state_root).await;
    let inputs = kinds.iter().filter(|k| *k == "input_envelope").count();
    let outputs = kinds.iter().filter(|k| *k == "output_envelope").count();
    assert_eq!(inputs, 2);
    assert_eq!(outputs, 2);
}

#[tokio::test]
async fn originality_echoes_the_first_prompt_forever() {
    let harness = TestHarness::new().await;
    harness.initialize().await;

    // A later turn with a different prompt does not replace the stored
    // one; the mismatch is only logged.
    let envelope = harness
        .controller
        .handle_turn(warden_protocol::TurnRequest {
            verb: "read_file_lines".to_string(),
            args: Some(json!({"file": "src/target.ts"})),
            original_prompt: Some("a totally different prompt".to_string()),
            run_session_id: Some("rs-1".to_string()),
            work_id: Some("w-1".to_string()),
            agent_id: Some("agent-1".to_string()),
            trace_meta: None,
        })
        .await;
    assert_eq!(
        envelope.original_prompt.as_deref(),
        Some(crate::suite::common::PROMPT)
    );

    harness.settle_events().await;
    let kinds = replay_event_kinds(&harness.config.state_root).await;
    assert!(kinds.iter().any(|k| k == "prompt_mismatch"));
}

#[tokio::test]
async fn budget_threshold_blocks_mutations_but_not_safe_verbs() {
    // Threshold low enough that the first turn crosses it.
    let harness = TestHarness::with_budget(100, 10).await;
    let init = harness.initialize().await;
    assert!(init.budget_status.used >= 10);

    let envelope = harness
        .turn(
            "apply_code_patch",
            json!({
                "nodeId": "c1",
                "targetFile": "src/target.ts",
                "operation": "replace_text",
                "find": "a",
                "replace": "b"
            }),
        )
        .await;
    assert!(
        envelope
            .deny_reasons
            .contains(&DenyCode::BudgetThresholdExceeded)
    );
    assert_eq!(envelope.state, SessionState::BlockedBudget);
    assert!(envelope.budget_status.blocked);
    assert!(envelope.capabilities.contains(&"escalate".to_string()));

    // Budget-safe verbs keep working in the blocked state.
    let escalate = harness
        .turn("escalate", json!({"need": "more symbol context"}))
        .await;
    assert!(
        !escalate
            .deny_reasons
            .contains(&DenyCode::BudgetThresholdExceeded)
    );
}

#[tokio::test]
async fn second_agent_joins_the_work_unit_with_independent_budget() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    assert_eq!(init.agent_id, "agent-1");
    // A second turn for agent-1 accumulates into its own counter.
    let first = harness
        .turn("read_file_lines", json!({"file": "src/target.ts"}))
        .await;

    // Second arrival names the work unit but no agent: a sub-agent is
    // minted and sees the shared pack.
    let second = harness
        .turn_with_ids(
            "read_file_lines",
            json!({"file": "src/target.ts"}),
            Some("rs-1"),
            Some("w-1"),
            None,
        )
        .await;
    assert!(second.deny_reasons.is_empty(), "{:?}", second.deny_reasons);
    assert_ne!(second.agent_id, first.agent_id);
    assert_eq!(second.work_id, first.work_id);
    // The shared strategy comes from the pack the first agent sealed.
    assert_eq!(second.knowledge_strategy.id, "baseline");

    // Token accounting stays per-agent: the sub-agent's usage reflects
    // only its own turn.
    assert!(second.budget_status.used < first.budget_status.used);

    harness.settle_events().await;
    let kinds = replay_event_kinds(&harness.config.state_root).await;
    assert!(kinds.iter().any(|k| k == "sub_agent_joined"));
}

#[tokio::test]
async fn completion_gate_holds_until_every_node_finishes() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    let submit = harness
        .turn("submit_execution_plan", json!({"plan": harness.valid_plan(&pack_hash)}))
        .await;
    assert!(submit.deny_reasons.is_empty(), "{:?}", submit.result);
    assert_eq!(submit.state, SessionState::PlanAccepted);
    assert_eq!(submit.progress.total, 2);

    // Signalling with nodes pending is denied.
    let early = harness.turn("signal_task_complete", json!({})).await;
    assert!(early.deny_reasons.contains(&DenyCode::PlanVerificationWeak));
    assert_eq!(early.state, SessionState::PlanAccepted);

    // Execute the change node, then the validate node.
    let patch = harness
        .turn(
            "apply_code_patch",
            json!({
                "nodeId": "c1",
                "targetFile": "src/target.ts",
                "operation": "ast_codemod",
                "codemodId": "rename_identifier_in_file",
                "params": {"from": "TargetSymbol", "to": "RenamedSymbol"}
            }),
        )
        .await;
    assert!(patch.deny_reasons.is_empty(), "{:?}", patch.result);

    let validate = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "(async () => { return true; })()",
                "artifactOutput": "run.json",
                "expectedShape": "object"
            }),
        )
        .await;
    assert!(validate.deny_reasons.is_empty(), "{:?}", validate.result);
    assert_eq!(validate.progress.remaining, 0);

    let done = harness.turn("signal_task_complete", json!({})).await;
    assert!(done.deny_reasons.is_empty());
    assert_eq!(done.state, SessionState::Completed);

    // Terminal states only accept the completion verb.
    let after = harness
        .turn("read_file_lines", json!({"file": "src/target.ts"}))
        .await;
    assert!(after.deny_reasons.contains(&DenyCode::PlanCapabilityScope));
}
