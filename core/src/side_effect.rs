//! The `execute_gated_side_effect` handler. Gates come only from the
//! accepted plan's side_effect nodes, never from the request.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::artifacts::ArtifactBundle;
use crate::collision::Reservation;
use crate::session::NodeStatus;
use crate::turn::HandlerOutcome;
use crate::turn::TurnContext;
use warden_protocol::DenyCode;
use warden_protocol::PlanNodeKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SideEffectArgs {
    node_id: String,
    commit_gate_id: String,
    #[serde(default)]
    payload: Option<JsonValue>,
}

pub(crate) async fn execute_gated_side_effect(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: SideEffectArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    let effect = {
        let unit = ctx.unit.lock().await;
        let shared = &unit.shared;
        let Some(plan) = &shared.plan else {
            return HandlerOutcome::deny_with(
                DenyCode::ExecUngatedSideEffect,
                json!({"nodeId": args.node_id}),
            );
        };
        let Some(node) = plan.nodes.iter().find(|n| n.id == args.node_id) else {
            return HandlerOutcome::deny_with(
                DenyCode::ExecUngatedSideEffect,
                json!({"nodeId": args.node_id, "detail": "no such plan node"}),
            );
        };
        if node.kind != PlanNodeKind::SideEffect {
            return HandlerOutcome::deny_with(
                DenyCode::ExecUngatedSideEffect,
                json!({"nodeId": args.node_id, "detail": "node is not a side_effect"}),
            );
        }

        // The gate must match the plan's gate for this node and be among
        // the approved set.
        let approved = node.commit_gate_id.as_deref() == Some(args.commit_gate_id.as_str())
            && shared.approved_gates.contains(&args.commit_gate_id);
        if !approved {
            return HandlerOutcome::deny_with(
                DenyCode::ExecUngatedSideEffect,
                json!({"nodeId": args.node_id, "commitGateId": args.commit_gate_id}),
            );
        }

        // Its validations must have passed before the effect fires.
        let validations_pending = node.depends_on.iter().any(|dep| {
            plan.nodes
                .iter()
                .any(|n| n.id == *dep && n.kind == PlanNodeKind::Validate)
                && shared.node_status.get(dep) != Some(&NodeStatus::Completed)
        });
        if validations_pending {
            return HandlerOutcome::deny_with(
                DenyCode::ExecUngatedSideEffect,
                json!({"nodeId": args.node_id, "detail": "validations pending"}),
            );
        }

        node.effect.clone().unwrap_or_default()
    };

    let reservation = Reservation {
        operation_id: args.node_id.clone(),
        external_gates: vec![args.commit_gate_id.clone()],
        ..Default::default()
    };
    let Some(_held) = ctx.collision.acquire(&ctx.key.guard_key(), reservation) else {
        return HandlerOutcome::deny_with(
            DenyCode::ExecSideEffectCollision,
            json!({"nodeId": args.node_id, "commitGateId": args.commit_gate_id}),
        );
    };

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
            "effect": effect,
            "commitGateId": args.commit_gate_id,
            "payload": args.payload,
        }))
        .and_then(|_| {
            bundle.write_log(&format!(
                "execute_gated_side_effect node={} gate={} effect={effect}\n",
                args.node_id, args.commit_gate_id
            ))
        })
        .and_then(|_| bundle.write_trace_refs(&json!({"traceRef": ctx.trace_ref})))
        .and_then(|_| bundle.write_validation(&json!({"gateVerified": true})));
    if let Err(e) = persisted {
        tracing::error!("failed to persist side-effect bundle: {e}");
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

    HandlerOutcome::ok(json!({
        "nodeId": args.node_id,
        "effect": effect,
        "commitGateId": args.commit_gate_id,
        "bundleDir": bundle.dir(),
    }))
}
