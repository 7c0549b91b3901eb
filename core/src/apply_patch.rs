//! The `apply_code_patch` handler: scope checks against the pack and the
//! accepted plan, a collision reservation for the write, and the artifact
//! bundle for the node.

use serde::Deserialize;
use serde_json::json;

use crate::artifacts::ArtifactBundle;
use crate::collision::Reservation;
use crate::session::NodeStatus;
use crate::turn::HandlerOutcome;
use crate::turn::TurnContext;
use warden_patch::PatchOp;
use warden_patch::apply_patch_op;
use warden_patch::parse_codemod_citation;
use warden_protocol::DenyCode;
use warden_protocol::EventKind;
use warden_protocol::PlanNodeKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyPatchArgs {
    node_id: String,
    target_file: String,
    #[serde(flatten)]
    op: PatchOp,
}

pub(crate) async fn apply_code_patch(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: ApplyPatchArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    // Gather everything needed from shared state, then release the lock
    // before any file I/O.
    let target_symbols = {
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
        if node.kind != PlanNodeKind::Change
            || node.target_file.as_deref() != Some(args.target_file.as_str())
        {
            return HandlerOutcome::deny_with(
                DenyCode::PlanScopeViolation,
                json!({"nodeId": args.node_id, "targetFile": args.target_file}),
            );
        }
        if !pack.files.contains(&args.target_file) {
            return HandlerOutcome::deny_with(
                DenyCode::PackScopeViolation,
                json!({"targetFile": args.target_file}),
            );
        }

        // An ast_codemod must be cited by the node it executes.
        if let Some(codemod_id) = args.op.codemod_id() {
            let cited = node.citations.iter().any(|c| {
                parse_codemod_citation(c).is_some_and(|(id, _)| id == codemod_id)
            });
            if !cited {
                return HandlerOutcome::deny_with(
                    DenyCode::PlanPolicyViolation,
                    json!({"nodeId": args.node_id, "codemodId": codemod_id}),
                );
            }
        }

        // Symbol scope: a rename must stay within the node's declared
        // symbols.
        if let PatchOp::AstCodemod { params, .. } = &args.op
            && !node.target_symbols.is_empty()
            && let Some(from) = params.get("from")
            && !node.target_symbols.contains(from)
        {
            return HandlerOutcome::deny_with(
                DenyCode::PlanScopeViolation,
                json!({"nodeId": args.node_id, "symbol": from}),
            );
        }

        node.target_symbols.clone()
    };

    // Reservation covers the file and the declared symbols for the whole
    // mutation.
    let reservation = Reservation {
        operation_id: args.node_id.clone(),
        files: vec![args.target_file.clone()],
        symbols: target_symbols,
        ..Default::default()
    };
    let Some(_held) = ctx.collision.acquire(&ctx.key.guard_key(), reservation) else {
        return HandlerOutcome::deny_with(
            DenyCode::ExecSideEffectCollision,
            json!({"nodeId": args.node_id, "targetFile": args.target_file}),
        );
    };

    let path = ctx.config.worktree_root.join(&args.target_file);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            return HandlerOutcome::deny_with(
                DenyCode::PackScopeViolation,
                json!({"targetFile": args.target_file, "error": e.to_string()}),
            );
        }
    };

    let outcome = match apply_patch_op(&contents, &args.op) {
        Ok(outcome) => outcome,
        Err(e) => {
            return HandlerOutcome::deny_with(
                DenyCode::PlanPolicyViolation,
                json!({"nodeId": args.node_id, "error": e.to_string()}),
            );
        }
    };

    if let Err(e) = tokio::fs::write(&path, &outcome.new_content).await {
        let mut result = HandlerOutcome::deny_with(
            DenyCode::PlanVerificationWeak,
            json!({"nodeId": args.node_id, "error": e.to_string()}),
        );
        result.suggested_action = Some("retry after resolving the write failure".to_string());
        return result;
    }

    // Durable outputs for the node.
    let bundle = match write_bundle(ctx, &args, &outcome) {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::error!("failed to write artifact bundle: {e}");
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id}),
            );
        }
    };

    {
        let mut unit = ctx.unit.lock().await;
        unit.shared
            .node_status
            .insert(args.node_id.clone(), NodeStatus::Completed);
    }

    let _ = ctx
        .events
        .append(
            EventKind::NodeBundleWritten,
            &ctx.ids.run_session_id,
            &ctx.ids.work_id,
            &ctx.ids.agent_id,
            json!({"nodeId": args.node_id, "bundle": bundle.dir()}),
        )
        .await;

    HandlerOutcome::ok(json!({
        "nodeId": args.node_id,
        "targetFile": args.target_file,
        "diffSummary": outcome.summary,
        "bundleDir": bundle.dir(),
    }))
}

fn write_bundle(
    ctx: &TurnContext<'_>,
    args: &ApplyPatchArgs,
    outcome: &warden_patch::PatchOutcome,
) -> crate::error::Result<ArtifactBundle> {
    let nodes_dir = ctx.config.nodes_dir(&ctx.ids.work_id);
    let bundle = ArtifactBundle::create(&nodes_dir, &args.node_id)?;
    bundle.write_result(&json!({
        "nodeId": args.node_id,
        "targetFile": args.target_file,
        "changed": outcome.summary.changed,
    }))?;
    bundle.write_diff_summary(&outcome.summary)?;
    bundle.write_log(&format!(
        "apply_code_patch {}\n{}\n",
        args.target_file, outcome.unified_diff
    ))?;
    bundle.write_trace_refs(&json!({"traceRef": ctx.trace_ref}))?;
    bundle.write_validation(&json!({"scopeChecked": true, "citationChecked": true}))?;
    Ok(bundle)
}
