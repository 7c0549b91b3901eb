use pretty_assertions::assert_eq;
use serde_json::json;
use warden_protocol::DenyCode;

use crate::suite::common::TestHarness;
use crate::suite::common::replay_event_kinds;

fn write_override(harness: &TestHarness, name: &str, body: serde_json::Value) {
    std::fs::create_dir_all(&harness.config.overrides_dir).expect("overrides dir");
    std::fs::write(
        harness.config.overrides_dir.join(name),
        body.to_string(),
    )
    .expect("write override");
}

#[tokio::test]
async fn repeated_rejections_scaffold_a_pending_correction() {
    let harness = TestHarness::new().await;
    harness.initialize().await;

    for _ in 0..3 {
        let envelope = harness
            .turn("read_file_lines", json!({"file": "not/in/pack.ts"}))
            .await;
        assert!(envelope.deny_reasons.contains(&DenyCode::PackScopeViolation));
    }

    harness.settle_events().await;
    let kinds = replay_event_kinds(&harness.config.state_root).await;
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "pending_correction_created")
            .count(),
        1
    );

    // The scaffold is a pending record with the trigger pre-populated and
    // the payload left blank for human completion.
    let records: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(harness.config.state_root.join("memory/records.json"))
            .expect("records"),
    )
    .expect("records json");
    let scaffold = records
        .as_array()
        .expect("array")
        .iter()
        .find(|r| r["provenance"]["trigger"] == "PACK_SCOPE_VIOLATION")
        .expect("scaffolded record");
    assert_eq!(scaffold["lifecycle"], "pending");
    assert_eq!(scaffold["payload"], serde_json::Value::Null);

    // A fourth rejection does not scaffold a second candidate.
    harness
        .turn("read_file_lines", json!({"file": "not/in/pack.ts"}))
        .await;
    harness.settle_events().await;
    let kinds = replay_event_kinds(&harness.config.state_root).await;
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "pending_correction_created")
            .count(),
        1
    );
}

#[tokio::test]
async fn overrides_are_ingested_before_the_pack_is_built() {
    let harness = TestHarness::new().await;
    // A strategy override dropped before the first turn must shape the
    // very first pack.
    write_override(
        &harness,
        "force-migration.json",
        json!({
            "enforcementType": "strategy_signal",
            "payload": {"feature": "migrationInPlay", "value": true}
        }),
    );

    let init = harness.initialize().await;
    assert_eq!(init.knowledge_strategy.id, "migration_guarded");
    let signature = init
        .knowledge_strategy
        .context_signature
        .expect("signature");
    assert!(signature.migration_in_play);

    // The drop-folder file was marked processed.
    assert!(
        harness
            .config
            .overrides_dir
            .join("force-migration.json.processed")
            .exists()
    );
}

#[tokio::test]
async fn plan_rule_overrides_enforce_their_deny_code() {
    let harness = TestHarness::new().await;
    write_override(
        &harness,
        "require-migration.json",
        json!({
            "enforcementType": "plan_rule",
            "payload": {
                "id": "require-migration-step",
                "description": "schema work needs a migration change",
                "requiredSteps": [{"kind": "change", "targetPattern": "migrations/*"}],
                "denyCode": "PLAN_NEEDS_MIGRATION_STEP"
            }
        }),
    );

    let init = harness.initialize().await;
    let pack_hash = init.result["packHash"].as_str().expect("hash").to_string();

    // Evidence minima for the migration strategy stay baseline here; the
    // plan is otherwise valid but lacks the required migration step.
    let envelope = harness
        .turn(
            "submit_execution_plan",
            json!({"plan": harness.valid_plan(&pack_hash)}),
        )
        .await;
    assert!(
        envelope
            .deny_reasons
            .contains(&DenyCode::Rule("PLAN_NEEDS_MIGRATION_STEP".to_string())),
        "{:?}",
        envelope.deny_reasons
    );
}
