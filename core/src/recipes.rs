//! The `run_automation_recipe` handler: registered multi-step patch
//! sequences, executed under one reservation and recorded as recipe usage.

use serde::Deserialize;
use serde_json::json;

use crate::artifacts::ArtifactBundle;
use crate::collision::Reservation;
use crate::session::NodeStatus;
use crate::turn::HandlerOutcome;
use crate::turn::TurnContext;
use warden_patch::apply_patch_op;
use warden_protocol::DenyCode;
use warden_protocol::EventKind;
use warden_protocol::PlanNodeKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipeArgs {
    node_id: String,
    recipe_id: String,
}

pub(crate) async fn run_automation_recipe(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: RecipeArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    let Some(recipe) = ctx.config.recipe(&args.recipe_id) else {
        return HandlerOutcome::deny_with(
            DenyCode::PlanPolicyViolation,
            json!({"recipeId": args.recipe_id, "detail": "unregistered recipe"}),
        );
    };

    {
        let unit = ctx.unit.lock().await;
        let shared = &unit.shared;
        let Some(pack) = &shared.pack else {
            return HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"nodeId": args.node_id}),
            );
        };
        let Some(plan) = &shared.plan else {
            return HandlerOutcome::deny_with(
                DenyCode::PlanScopeViolation,
                json!({"nodeId": args.node_id}),
            );
        };
        let Some(node) = plan.nodes.iter().find(|n| n.id == args.node_id) else {
            return HandlerOutcome::deny_with(
                DenyCode::PlanScopeViolation,
                json!({"nodeId": args.node_id, "detail": "no such plan node"}),
            );
        };
        // A recipe runs on behalf of a change node that cites it.
        let citation = format!("recipe:{}", args.recipe_id);
        if node.kind != PlanNodeKind::Change || !node.citations.contains(&citation) {
            return HandlerOutcome::deny_with(
                DenyCode::PlanPolicyViolation,
                json!({"nodeId": args.node_id, "recipeId": args.recipe_id}),
            );
        }
        for step in &recipe.steps {
            if !pack.files.contains(&step.target_file) {
                return HandlerOutcome::deny_with(
                    DenyCode::PackScopeViolation,
                    json!({"recipeId": args.recipe_id, "targetFile": step.target_file}),
                );
            }
        }
    }

    // One reservation spans every file the recipe touches.
    let reservation = Reservation {
        operation_id: args.node_id.clone(),
        files: recipe.steps.iter().map(|s| s.target_file.clone()).collect(),
        ..Default::default()
    };
    let Some(_held) = ctx.collision.acquire(&ctx.key.guard_key(), reservation) else {
        return HandlerOutcome::deny_with(
            DenyCode::ExecSideEffectCollision,
            json!({"nodeId": args.node_id, "recipeId": args.recipe_id}),
        );
    };

    let mut step_results = Vec::new();
    for (idx, step) in recipe.steps.iter().enumerate() {
        let path = ctx.config.worktree_root.join(&step.target_file);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                return HandlerOutcome::deny_with(
                    DenyCode::PackScopeViolation,
                    json!({"targetFile": step.target_file, "error": e.to_string()}),
                );
            }
        };
        let outcome = match apply_patch_op(&contents, &step.op) {
            Ok(outcome) => outcome,
            Err(e) => {
                return HandlerOutcome::deny_with(
                    DenyCode::PlanPolicyViolation,
                    json!({"recipeId": args.recipe_id, "step": idx, "error": e.to_string()}),
                );
            }
        };
        if let Err(e) = tokio::fs::write(&path, &outcome.new_content).await {
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"targetFile": step.target_file, "error": e.to_string()}),
            );
        }
        step_results.push(json!({
            "step": idx,
            "targetFile": step.target_file,
            "diffSummary": outcome.summary,
        }));
    }

    let nodes_dir = ctx.config.nodes_dir(&ctx.ids.work_id);
    let bundle = match ArtifactBundle::create(&nodes_dir, &args.node_id) {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::error!("failed to create artifact bundle: {e}");
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id}),
            );
        }
    };
    let persisted = bundle
        .write_result(&json!({
            "nodeId": args.node_id,
            "recipeId": args.recipe_id,
            "steps": step_results,
        }))
        .and_then(|_| {
            bundle.write_log(&format!(
                "run_automation_recipe node={} recipe={} steps={}\n",
                args.node_id,
                args.recipe_id,
                recipe.steps.len()
            ))
        })
        .and_then(|_| bundle.write_trace_refs(&json!({"traceRef": ctx.trace_ref})));
    if let Err(e) = persisted {
        tracing::error!("failed to persist recipe bundle: {e}");
        return HandlerOutcome::deny_with(
            DenyCode::PlanVerificationWeak,
            json!({"nodeId": args.node_id}),
        );
    }

    {
        let mut unit = ctx.unit.lock().await;
        unit.shared
            .node_status
            .insert(args.node_id.clone(), NodeStatus::Completed);
    }

    let _ = ctx
        .events
        .append(
            EventKind::RecipeUsage,
            &ctx.ids.run_session_id,
            &ctx.ids.work_id,
            &ctx.ids.agent_id,
            json!({"recipeId": args.recipe_id, "nodeId": args.node_id, "steps": recipe.steps.len()}),
        )
        .await;

    HandlerOutcome::ok(json!({
        "nodeId": args.node_id,
        "recipeId": args.recipe_id,
        "steps": step_results,
        "bundleDir": bundle.dir(),
    }))
}
