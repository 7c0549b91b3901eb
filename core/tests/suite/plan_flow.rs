use pretty_assertions::assert_eq;
use serde_json::json;
use warden_core::context_pack::ContextPack;
use warden_protocol::DenyCode;
use warden_protocol::SessionState;

use crate::suite::common::TestHarness;
use crate::suite::common::deny_strings;

#[tokio::test]
async fn unregistered_codemod_citation_rejects_the_plan() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    let mut plan = harness.valid_plan(&pack_hash);
    plan["nodes"][0]["citations"] = json!(["codemod:invented_custom_transform"]);

    let envelope = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanPolicyViolation));
    // The plan was not stored: no progress counters, still PLANNING.
    assert_eq!(envelope.state, SessionState::Planning);
    assert_eq!(envelope.progress.total, 0);
}

#[tokio::test]
async fn validator_returns_every_matching_code_in_one_pass() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    let mut plan = harness.valid_plan(&pack_hash);
    // Break several things at once: drop the snapshot, cite an unknown
    // codemod, and point the change outside the pack.
    plan["snapshot"] = json!(null);
    plan["nodes"][0]["citations"] = json!(["codemod:invented_custom_transform"]);
    plan["nodes"][0]["targetFile"] = json!("not/in/pack.ts");

    let envelope = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    let codes = deny_strings(&envelope);
    assert!(codes.contains(&"PLAN_MISSING_REQUIRED_FIELDS".to_string()));
    assert!(codes.contains(&"PLAN_POLICY_VIOLATION".to_string()));
    assert!(codes.contains(&"PLAN_SCOPE_VIOLATION".to_string()));
}

#[tokio::test]
async fn patch_with_uncited_codemod_is_a_policy_violation() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    // Valid plan, but the change node does not cite the codemod it will
    // later try to run.
    let mut plan = harness.valid_plan(&pack_hash);
    plan["nodes"][0]["citations"] = json!([]);
    let submit = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    assert!(submit.deny_reasons.is_empty(), "{:?}", submit.result);

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
    assert!(envelope.deny_reasons.contains(&DenyCode::PlanPolicyViolation));

    // The file is untouched.
    let contents =
        std::fs::read_to_string(harness.config.worktree_root.join("src/target.ts"))
            .expect("read target");
    assert!(contents.contains("TargetSymbol"));
}

#[tokio::test]
async fn escalation_grows_the_pack_monotonically_and_rehashes() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let hash_before = init.result["packHash"].as_str().expect("hash").to_string();
    let files_before = init.result["files"].as_array().expect("files").len();

    // Seed another file the index knows about.
    std::fs::write(
        harness.config.worktree_root.join("src/other.ts"),
        "export const Other = 2;\n",
    )
    .expect("seed other.ts");

    let envelope = harness
        .turn(
            "escalate",
            json!({
                "need": "cover the sibling module",
                "requestedEvidence": [{"kind": "file", "reference": "src/other.ts"}]
            }),
        )
        .await;
    assert!(envelope.deny_reasons.is_empty(), "{:?}", envelope.result);
    assert_eq!(
        envelope.result["delta"]["addedFiles"],
        json!(["src/other.ts"])
    );
    let new_hash = envelope.result["delta"]["newHash"]
        .as_str()
        .expect("new hash");
    assert_ne!(new_hash, hash_before);

    // The rewritten pack on disk verifies its own hash and did not
    // shrink.
    let pack = ContextPack::load(&harness.pack_path()).expect("load pack");
    assert!(pack.verify_hash().expect("verify"));
    assert!(pack.files.len() > files_before);
    assert!(pack.files.contains("src/target.ts"));
    assert!(pack.files.contains("src/other.ts"));
}

#[tokio::test]
async fn accepted_plan_revalidates_cleanly_after_reacceptance() {
    let harness = TestHarness::new().await;
    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    let plan = harness.valid_plan(&pack_hash);
    let first = harness
        .turn("submit_execution_plan", json!({"plan": plan.clone()}))
        .await;
    assert!(first.deny_reasons.is_empty());

    // Submitting the identical plan again produces the same acceptance:
    // validation is deterministic over the same enforcement bundle.
    let second = harness
        .turn("submit_execution_plan", json!({"plan": plan}))
        .await;
    assert!(second.deny_reasons.is_empty());
    assert_eq!(second.state, SessionState::PlanAccepted);
}
