//! The sandboxed evaluator behind `run_sandboxed_code`: preflight the
//! async self-invoking form, spawn the configured interpreter, enforce the
//! wall clock externally, and reject placeholder-looking returns.

use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::artifacts::ArtifactBundle;
use crate::session::NodeStatus;
use crate::turn::HandlerOutcome;
use crate::turn::TurnContext;
use warden_protocol::DenyCode;
use warden_protocol::PlanNodeKind;

/// Returns that strongly suggest the evaluator was short-circuited.
const PLACEHOLDER_RETURNS: &[&str] = &["placeholder result", "todo", "not implemented"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxArgs {
    node_id: String,
    expression: String,
    #[serde(default)]
    inputs: Option<JsonValue>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    memory_cap_mb: Option<u64>,
    /// Relative name of the artifact the run must produce; runs without
    /// one are not replayable and are rejected outright.
    #[serde(default)]
    artifact_output: Option<String>,
    /// Expected JSON type of the return: `object`, `array`, `string`,
    /// `number` or `boolean`.
    #[serde(default)]
    expected_shape: Option<String>,
}

fn is_async_self_invoking(expression: &str) -> bool {
    // `(async () => { ... })()`, modulo whitespace and a trailing
    // semicolon.
    Regex::new(r"^\s*\(\s*async\s*\(\s*\)\s*=>\s*\{[\s\S]*\}\s*\)\s*\(\s*\)\s*;?\s*$")
        .is_ok_and(|p| p.is_match(expression))
}

fn looks_like_placeholder(stdout: &str) -> bool {
    let trimmed = stdout.trim().trim_matches('"').trim();
    PLACEHOLDER_RETURNS
        .iter()
        .any(|p| trimmed.eq_ignore_ascii_case(p))
}

fn shape_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Object(_) => "object",
        JsonValue::Array(_) => "array",
        JsonValue::String(_) => "string",
        JsonValue::Number(_) => "number",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Null => "null",
    }
}

pub(crate) async fn run_sandboxed_code(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: SandboxArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    if !is_async_self_invoking(&args.expression) {
        return HandlerOutcome::deny_with(
            DenyCode::PlanMissingRequiredFields,
            json!({"nodeId": args.node_id, "detail": "expression must be an async self-invoking function"}),
        );
    }
    let Some(artifact_output) = &args.artifact_output else {
        return HandlerOutcome::deny_with(
            DenyCode::PlanMissingRequiredFields,
            json!({"nodeId": args.node_id, "detail": "artifactOutput is required; runs must be replayable"}),
        );
    };

    {
        let unit = ctx.unit.lock().await;
        let Some(plan) = &unit.shared.plan else {
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
        if node.kind != PlanNodeKind::Validate {
            return HandlerOutcome::deny_with(
                DenyCode::PlanScopeViolation,
                json!({"nodeId": args.node_id, "detail": "sandbox runs implement validate nodes"}),
            );
        }
    }

    let timeout_ms = args
        .timeout_ms
        .unwrap_or(ctx.config.sandbox.default_timeout_ms);
    let memory_cap_mb = args.memory_cap_mb.unwrap_or(ctx.config.sandbox.memory_cap_mb);

    let interpreter = &ctx.config.sandbox.interpreter;
    let mut command = Command::new(&interpreter[0]);
    command
        .args(&interpreter[1..])
        .arg(&args.expression)
        .env("WARDEN_MEMORY_CAP_MB", memory_cap_mb.to_string())
        .current_dir(&ctx.config.worktree_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id, "error": format!("spawn failed: {e}")}),
            );
        }
    };

    // Declared inputs arrive on stdin as one JSON document.
    if let Some(mut stdin) = child.stdin.take() {
        let inputs = args.inputs.clone().unwrap_or(JsonValue::Null);
        let payload = inputs.to_string();
        let _ = stdin.write_all(payload.as_bytes()).await;
        drop(stdin);
    }

    let waited =
        tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await;
    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id, "error": e.to_string()}),
            );
        }
        Err(_elapsed) => {
            mark_failed(ctx, &args.node_id).await;
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id, "detail": format!("wall clock exceeded {timeout_ms}ms")}),
            );
        }
    };
    let duration = start.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    if exit_code != 0 {
        mark_failed(ctx, &args.node_id).await;
        return HandlerOutcome::deny_with(
            DenyCode::PlanVerificationWeak,
            json!({"nodeId": args.node_id, "exitCode": exit_code, "stderr": stderr}),
        );
    }
    if looks_like_placeholder(&stdout) {
        mark_failed(ctx, &args.node_id).await;
        return HandlerOutcome::deny_with(
            DenyCode::PlanVerificationWeak,
            json!({"nodeId": args.node_id, "detail": "placeholder-looking return"}),
        );
    }

    let parsed: Option<JsonValue> = serde_json::from_str(stdout.trim()).ok();
    if let Some(expected) = &args.expected_shape {
        let actual = parsed.as_ref().map(shape_of).unwrap_or("string");
        if actual != expected {
            mark_failed(ctx, &args.node_id).await;
            return HandlerOutcome::deny_with(
                DenyCode::PlanVerificationWeak,
                json!({"nodeId": args.node_id, "expectedShape": expected, "actualShape": actual}),
            );
        }
    }

    // Persist the bundle; the declared artifact output lands inside it.
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
    let Some(artifact_path) =
        crate::adapters::resolve_under_root(bundle.dir(), artifact_output)
    else {
        return HandlerOutcome::deny_with(
            DenyCode::PlanMissingRequiredFields,
            json!({"nodeId": args.node_id, "detail": "artifactOutput must stay inside the bundle"}),
        );
    };
    let result_value = parsed.clone().unwrap_or(JsonValue::String(stdout.clone()));
    let persisted = bundle
        .write_result(&json!({
            "nodeId": args.node_id,
            "exitCode": exit_code,
            "durationMs": duration.as_millis() as u64,
            "return": result_value,
        }))
        .and_then(|_| {
            bundle.write_log(&format!(
                "run_sandboxed_code node={} exit={exit_code}\n--- stdout\n{stdout}\n--- stderr\n{stderr}",
                args.node_id
            ))
        })
        .and_then(|_| bundle.write_trace_refs(&json!({"traceRef": ctx.trace_ref})))
        .and_then(|_| bundle.write_validation(&json!({"passed": true})))
        .and_then(|_| {
            if let Some(parent) = artifact_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&artifact_path, stdout.as_bytes()).map_err(Into::into)
        });
    if let Err(e) = persisted {
        tracing::error!("failed to persist sandbox outputs: {e}");
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
        "exitCode": exit_code,
        "durationMs": duration.as_millis() as u64,
        "return": result_value,
        "bundleDir": bundle.dir(),
    }))
}

async fn mark_failed(ctx: &TurnContext<'_>, node_id: &str) {
    let mut unit = ctx.unit.lock().await;
    unit.shared
        .node_status
        .insert(node_id.to_string(), NodeStatus::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preflight_accepts_the_async_iife_form() {
        assert!(is_async_self_invoking("(async () => { return 1; })()"));
        assert!(is_async_self_invoking(
            " ( async ( ) => {\n const x = 1;\n return x;\n} ) ( ) ;"
        ));
        assert!(!is_async_self_invoking("function f() { return 1; }"));
        assert!(!is_async_self_invoking("(() => 1)()"));
        assert!(!is_async_self_invoking("(async () => 1)()"));
    }

    #[test]
    fn placeholder_returns_are_detected() {
        assert!(looks_like_placeholder("placeholder result"));
        assert!(looks_like_placeholder("\"placeholder result\"\n"));
        assert!(looks_like_placeholder("Not Implemented"));
        assert!(!looks_like_placeholder("{\"rows\": 3}"));
    }

    #[test]
    fn shapes_are_named() {
        assert_eq!(shape_of(&json!({"a": 1})), "object");
        assert_eq!(shape_of(&json!([1])), "array");
        assert_eq!(shape_of(&json!(3)), "number");
    }
}
