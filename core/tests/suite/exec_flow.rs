use pretty_assertions::assert_eq;
use serde_json::json;
use warden_protocol::DenyCode;

use crate::suite::common::HarnessOptions;
use crate::suite::common::TestHarness;

async fn accepted_harness() -> (TestHarness, String) {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();
    let submit = harness
        .turn(
            "submit_execution_plan",
            json!({"plan": harness.valid_plan(&pack_hash)}),
        )
        .await;
    assert!(submit.deny_reasons.is_empty(), "{:?}", submit.result);
    (harness, pack_hash)
}

#[tokio::test]
async fn cited_codemod_rewrites_the_file_and_writes_the_bundle() {
    let (harness, _) = accepted_harness().await;

    let envelope = harness
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
    assert!(envelope.deny_reasons.is_empty(), "{:?}", envelope.result);

    let contents =
        std::fs::read_to_string(harness.config.worktree_root.join("src/target.ts"))
            .expect("read target");
    assert!(contents.contains("RenamedSymbol"));
    assert!(!contents.contains("TargetSymbol"));

    // diff.summary.json records at least one replacement.
    let summary_path = harness
        .config
        .nodes_dir("w-1")
        .join("c1/diff.summary.json");
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(summary_path).expect("summary"))
            .expect("summary json");
    assert_eq!(summary["changed"], json!(true));
    assert!(summary["replacements"].as_u64().expect("replacements") >= 1);

    for file in ["result.json", "op.log", "trace.refs.json", "validation.json"] {
        assert!(
            harness.config.nodes_dir("w-1").join("c1").join(file).exists(),
            "missing bundle file {file}"
        );
    }
}

#[tokio::test]
async fn symbol_outside_the_plan_scope_is_denied() {
    let (harness, _) = accepted_harness().await;

    let envelope = harness
        .turn(
            "apply_code_patch",
            json!({
                "nodeId": "c1",
                "targetFile": "src/target.ts",
                "operation": "ast_codemod",
                "codemodId": "rename_identifier_in_file",
                "params": {"from": "SomethingElse", "to": "Whatever"}
            }),
        )
        .await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanScopeViolation));
}

#[tokio::test]
async fn sandbox_preflight_rejects_non_iife_expressions() {
    let (harness, _) = accepted_harness().await;

    let envelope = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "console.log('hi')",
                "artifactOutput": "run.json"
            }),
        )
        .await;
    assert!(
        envelope
            .deny_reasons
            .contains(&DenyCode::PlanMissingRequiredFields)
    );
}

#[tokio::test]
async fn sandbox_without_artifact_output_is_not_replayable() {
    let (harness, _) = accepted_harness().await;

    let envelope = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "(async () => { return 1; })()"
            }),
        )
        .await;
    assert!(
        envelope
            .deny_reasons
            .contains(&DenyCode::PlanMissingRequiredFields)
    );
}

#[tokio::test]
async fn sandbox_rejects_placeholder_looking_returns() {
    let harness = TestHarness::with_sandbox_script("cat >/dev/null; echo 'placeholder result'")
        .await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();
    harness
        .turn(
            "submit_execution_plan",
            json!({"plan": harness.valid_plan(&pack_hash)}),
        )
        .await;

    let envelope = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "(async () => { return 'placeholder result'; })()",
                "artifactOutput": "run.json"
            }),
        )
        .await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanVerificationWeak));
    assert_eq!(envelope.progress.remaining, 2);
}

#[tokio::test]
async fn sandbox_wall_clock_is_enforced_externally() {
    let harness = TestHarness::with_sandbox_script("sleep 3").await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();
    harness
        .turn(
            "submit_execution_plan",
            json!({"plan": harness.valid_plan(&pack_hash)}),
        )
        .await;

    let envelope = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "(async () => { return 1; })()",
                "artifactOutput": "run.json",
                "timeoutMs": 100
            }),
        )
        .await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanVerificationWeak));
}

#[tokio::test]
async fn side_effects_fire_only_behind_their_approved_gate() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    let mut plan = harness.valid_plan(&pack_hash);
    plan["nodes"].as_array_mut().expect("nodes").push(json!({
        "id": "s1",
        "kind": "side_effect",
        "dependsOn": ["v1"],
        "commitGateId": "deploy-staging",
        "effect": "notify_downstream"
    }));
    let submit = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    assert!(submit.deny_reasons.is_empty(), "{:?}", submit.result);

    // A gate invented by the request never matches the plan.
    let wrong_gate = harness
        .turn(
            "execute_gated_side_effect",
            json!({"nodeId": "s1", "commitGateId": "deploy-production"}),
        )
        .await;
    assert!(
        wrong_gate
            .deny_reasons
            .contains(&DenyCode::ExecUngatedSideEffect)
    );

    // The right gate is still blocked while its validation is pending.
    let too_early = harness
        .turn(
            "execute_gated_side_effect",
            json!({"nodeId": "s1", "commitGateId": "deploy-staging"}),
        )
        .await;
    assert!(
        too_early
            .deny_reasons
            .contains(&DenyCode::ExecUngatedSideEffect)
    );

    // Pass the validation, then the effect goes through.
    let validate = harness
        .turn(
            "run_sandboxed_code",
            json!({
                "nodeId": "v1",
                "expression": "(async () => { return true; })()",
                "artifactOutput": "run.json"
            }),
        )
        .await;
    assert!(validate.deny_reasons.is_empty(), "{:?}", validate.result);

    let effect = harness
        .turn(
            "execute_gated_side_effect",
            json!({"nodeId": "s1", "commitGateId": "deploy-staging"}),
        )
        .await;
    assert!(effect.deny_reasons.is_empty(), "{:?}", effect.result);
    assert!(
        harness
            .config
            .nodes_dir("w-1")
            .join("s1/result.json")
            .exists()
    );
}

#[tokio::test]
async fn recipes_run_only_when_cited_by_a_change_node() {
    let harness = TestHarness::with_options(HarnessOptions {
        recipes: json!([{
            "id": "stamp_module",
            "description": "prefix the module with a generated marker",
            "steps": [{
                "targetFile": "src/target.ts",
                "operation": "replace_text",
                "find": "const TargetSymbol",
                "replace": "const STAMPED = true;\nconst TargetSymbol"
            }]
        }]),
        ..Default::default()
    })
    .await;

    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();
    let mut plan = harness.valid_plan(&pack_hash);
    plan["nodes"][0]["citations"] = json!(["recipe:stamp_module"]);
    let submit = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    assert!(submit.deny_reasons.is_empty(), "{:?}", submit.result);

    // An unregistered recipe is a policy violation.
    let unknown = harness
        .turn(
            "run_automation_recipe",
            json!({"nodeId": "c1", "recipeId": "not_a_recipe"}),
        )
        .await;
    assert!(unknown.deny_reasons.contains(&DenyCode::PlanPolicyViolation));

    let envelope = harness
        .turn(
            "run_automation_recipe",
            json!({"nodeId": "c1", "recipeId": "stamp_module"}),
        )
        .await;
    assert!(envelope.deny_reasons.is_empty(), "{:?}", envelope.result);

    let contents =
        std::fs::read_to_string(harness.config.worktree_root.join("src/target.ts"))
            .expect("read target");
    assert!(contents.starts_with("const STAMPED = true;"));

    harness.settle_events().await;
    let kinds = crate::suite::common::replay_event_kinds(&harness.config.state_root).await;
    assert!(kinds.iter().any(|k| k == "recipe_usage"));
}
