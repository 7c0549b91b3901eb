//! Read verbs and `write_scratch_file`. Every target is checked against
//! the pack allow-list (or the scratch root) before any byte is touched.

use serde::Deserialize;
use serde_json::json;

use crate::adapters::resolve_under_root;
use crate::turn::HandlerOutcome;
use crate::turn::TurnContext;
use warden_protocol::DenyCode;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileLinesArgs {
    file: String,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    end: Option<usize>,
}

pub(crate) async fn read_file_lines(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: ReadFileLinesArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    {
        let unit = ctx.unit.lock().await;
        let Some(pack) = &unit.shared.pack else {
            return HandlerOutcome::deny_with(
                DenyCode::PackInsufficient,
                json!({"file": args.file}),
            );
        };
        if !pack.files.contains(&args.file) {
            return HandlerOutcome::deny_with(
                DenyCode::PackScopeViolation,
                json!({"file": args.file}),
            );
        }
    }

    let path = ctx.config.worktree_root.join(&args.file);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            return HandlerOutcome::deny_with(
                DenyCode::PackScopeViolation,
                json!({"file": args.file, "error": e.to_string()}),
            );
        }
    };

    let start = args.start.unwrap_or(1).max(1);
    let lines: Vec<&str> = contents.lines().collect();
    let end = args.end.unwrap_or(lines.len()).min(lines.len());
    let slice: Vec<String> = if start <= end {
        lines[start - 1..end].iter().map(|l| l.to_string()).collect()
    } else {
        Vec::new()
    };

    HandlerOutcome::ok(json!({
        "file": args.file,
        "start": start,
        "end": end,
        "lines": slice,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupSymbolArgs {
    name: String,
}

pub(crate) async fn lookup_symbol_definition(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: LookupSymbolArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    let Some(symbol) = ctx.index.lookup_symbol(&args.name) else {
        return HandlerOutcome::ok(json!({"name": args.name, "found": false}));
    };

    let unit = ctx.unit.lock().await;
    let in_pack = unit
        .shared
        .pack
        .as_ref()
        .is_some_and(|p| p.files.contains(&symbol.file));
    if !in_pack {
        return HandlerOutcome::deny_with(
            DenyCode::PackScopeViolation,
            json!({"name": args.name, "declaringFile": symbol.file}),
        );
    }

    HandlerOutcome::ok(json!({
        "name": symbol.name,
        "found": true,
        "kind": symbol.kind,
        "declaringFile": symbol.file,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceSymbolArgs {
    name: String,
    #[serde(default)]
    depth: Option<usize>,
}

pub(crate) async fn trace_symbol_graph(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: TraceSymbolArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    let pack_files = {
        let unit = ctx.unit.lock().await;
        match &unit.shared.pack {
            Some(pack) => pack.files.as_slice().to_vec(),
            None => {
                return HandlerOutcome::deny_with(
                    DenyCode::PackInsufficient,
                    json!({"name": args.name}),
                );
            }
        }
    };

    let edges = ctx.graph.trace_symbol(&args.name, args.depth.unwrap_or(2));
    // Edges anchored to files outside the pack are withheld.
    let visible: Vec<_> = edges
        .into_iter()
        .filter(|e| e.file.as_ref().is_none_or(|f| pack_files.contains(f)))
        .collect();

    HandlerOutcome::ok(json!({
        "name": args.name,
        "edges": visible,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) async fn search_codebase_text(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: SearchArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };
    if args.query.is_empty() {
        return HandlerOutcome::bad_args_msg("query must be non-empty");
    }

    let pack_files = {
        let unit = ctx.unit.lock().await;
        match &unit.shared.pack {
            Some(pack) => pack.files.as_slice().to_vec(),
            None => {
                return HandlerOutcome::deny_with(
                    DenyCode::PackInsufficient,
                    json!({"query": args.query}),
                );
            }
        }
    };

    let limit = args.limit.unwrap_or(20);
    let mut hits = Vec::new();
    'files: for file in &pack_files {
        let path = ctx.config.worktree_root.join(file);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        for (idx, line) in contents.lines().enumerate() {
            if line.contains(&args.query) {
                hits.push(json!({
                    "file": file,
                    "line": idx + 1,
                    "snippet": line.trim(),
                }));
                if hits.len() >= limit {
                    break 'files;
                }
            }
        }
    }

    HandlerOutcome::ok(json!({"query": args.query, "hits": hits}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteScratchArgs {
    path: String,
    content: String,
}

pub(crate) async fn write_scratch_file(
    ctx: &TurnContext<'_>,
    args: serde_json::Value,
) -> HandlerOutcome {
    let args: WriteScratchArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return HandlerOutcome::bad_args(e),
    };

    let scratch_root = ctx.config.scratch_dir(&ctx.ids.work_id);
    let Some(path) = resolve_under_root(&scratch_root, &args.path) else {
        return HandlerOutcome::deny_with(
            DenyCode::PackScopeViolation,
            json!({"path": args.path}),
        );
    };

    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        return HandlerOutcome::deny_with(
            DenyCode::PackScopeViolation,
            json!({"path": args.path, "error": e.to_string()}),
        );
    }
    if let Err(e) = tokio::fs::write(&path, &args.content).await {
        return HandlerOutcome::deny_with(
            DenyCode::PackScopeViolation,
            json!({"path": args.path, "error": e.to_string()}),
        );
    }

    HandlerOutcome::ok(json!({
        "path": args.path,
        "bytes": args.content.len(),
    }))
}
