//! Shared harness for the lifecycle suite: a Controller wired to temp
//! directories, a seeded index snapshot, and a seeded worktree.

use std::path::Path;
use std::time::Duration;

use serde_json::Value as JsonValue;
use serde_json::json;
use warden_core::Config;
use warden_core::Controller;
use warden_core::config::FetcherConfig;
use warden_core::config::SandboxConfig;
use warden_protocol::ResponseEnvelope;
use warden_protocol::TurnRequest;

pub struct TestHarness {
    pub controller: Controller,
    pub config: Config,
    // Held for the lifetime of the test.
    _worktree: tempfile::TempDir,
    _state: tempfile::TempDir,
}

pub const PROMPT: &str = "Rename TargetSymbol in src/target.ts";

pub struct HarnessOptions {
    pub max_tokens: u64,
    pub threshold_tokens: u64,
    /// Script run by `sh -c` as the sandbox interpreter; the expression
    /// arrives as an extra positional argument it may ignore.
    pub sandbox_script: String,
    pub recipes: JsonValue,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_tokens: 200_000,
            threshold_tokens: 160_000,
            sandbox_script: "cat >/dev/null; echo '{\"ok\":true}'".to_string(),
            recipes: json!([]),
        }
    }
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_budget(max_tokens: u64, threshold_tokens: u64) -> Self {
        Self::with_options(HarnessOptions {
            max_tokens,
            threshold_tokens,
            ..Default::default()
        })
        .await
    }

    pub async fn with_sandbox_script(script: &str) -> Self {
        Self::with_options(HarnessOptions {
            sandbox_script: script.to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let worktree = tempfile::tempdir().expect("worktree tempdir");
        let state = tempfile::tempdir().expect("state tempdir");

        std::fs::create_dir_all(worktree.path().join("src")).expect("mkdir src");
        std::fs::write(
            worktree.path().join("src/target.ts"),
            "const TargetSymbol = 1;\nexport default TargetSymbol;\n",
        )
        .expect("seed target.ts");

        std::fs::write(
            state.path().join("index-snapshot.json"),
            json!({
                "symbols": [
                    {"name": "main", "kind": "entrypoint", "file": "src/target.ts"},
                    {"name": "TargetSymbol", "kind": "definition", "file": "src/target.ts"}
                ],
                "lexical": [
                    {"lexeme": "rename", "files": ["src/target.ts"]},
                    {"lexeme": "target", "files": ["src/target.ts"]}
                ]
            })
            .to_string(),
        )
        .expect("seed index snapshot");

        let config = Config {
            worktree_root: worktree.path().to_path_buf(),
            state_root: state.path().to_path_buf(),
            overrides_dir: worktree.path().join("memory/overrides"),
            inbox_dir: worktree.path().join("inbox"),
            max_tokens: options.max_tokens,
            threshold_tokens: options.threshold_tokens,
            friction_threshold: 3,
            contest_window_hours: 48,
            sandbox: SandboxConfig {
                // `sh -c <script> <expression>`: the script ignores the
                // appended expression and emits its own output.
                interpreter: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    options.sandbox_script.clone(),
                ],
                default_timeout_ms: 5_000,
                memory_cap_mb: 64,
            },
            fetchers: FetcherConfig::default(),
            recipes: serde_json::from_value(options.recipes.clone()).expect("recipes"),
        };

        let controller = Controller::new(config.clone())
            .await
            .expect("controller boot");

        Self {
            controller,
            config,
            _worktree: worktree,
            _state: state,
        }
    }

    pub async fn turn(&self, verb: &str, args: JsonValue) -> ResponseEnvelope {
        self.turn_with_ids(verb, args, Some("rs-1"), Some("w-1"), Some("agent-1"))
            .await
    }

    pub async fn turn_with_ids(
        &self,
        verb: &str,
        args: JsonValue,
        run_session_id: Option<&str>,
        work_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> ResponseEnvelope {
        self.controller
            .handle_turn(TurnRequest {
                verb: verb.to_string(),
                args: Some(args),
                original_prompt: Some(PROMPT.to_string()),
                run_session_id: run_session_id.map(str::to_string),
                work_id: work_id.map(str::to_string),
                agent_id: agent_id.map(str::to_string),
                trace_meta: None,
            })
            .await
    }

    pub async fn initialize(&self) -> ResponseEnvelope {
        let envelope = self.turn("initialize_work", json!({})).await;
        assert!(
            envelope.deny_reasons.is_empty(),
            "initialize_work denied: {:?} {:?}",
            envelope.deny_reasons,
            envelope.result
        );
        envelope
    }

    /// A plan that validates cleanly against the freshly sealed pack.
    pub fn valid_plan(&self, pack_hash: &str) -> JsonValue {
        json!({
            "planId": "p-1",
            "snapshot": "snap-1",
            "packRef": "context-pack.json",
            "packHash": pack_hash,
            "policyVersions": ["policies@1"],
            "scopeAllowListRef": "pack.files",
            "strategy": {
                "id": "baseline",
                "reasons": [{
                    "claim": "mechanical rename with existing coverage",
                    "evidence": [
                        {"category": "requirement", "source": "PLAT-4211"},
                        {"category": "code", "source": "src/target.ts"},
                        {"category": "code", "source": "src/other.ts"}
                    ]
                }]
            },
            "evidencePolicy": {"requirementMin": 1, "codeMin": 2, "policyMin": 0},
            "schemaVersion": "1",
            "nodes": [
                {
                    "id": "c1",
                    "kind": "change",
                    "targetFile": "src/target.ts",
                    "targetSymbols": ["TargetSymbol"],
                    "citations": ["codemod:rename_identifier_in_file"]
                },
                {
                    "id": "v1",
                    "kind": "validate",
                    "dependsOn": ["c1"],
                    "mapsTo": ["c1"],
                    "command": "(async () => { return true; })()"
                }
            ]
        })
    }

    /// Let the event-log writer task drain before replaying the log.
    pub async fn settle_events(&self) {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    pub fn pack_path(&self) -> std::path::PathBuf {
        self.config.pack_path("w-1")
    }
}

pub fn deny_strings(envelope: &ResponseEnvelope) -> Vec<String> {
    envelope
        .deny_reasons
        .iter()
        .map(|c| c.to_string())
        .collect()
}

pub async fn replay_event_kinds(state_root: &Path) -> Vec<String> {
    let path = state_root.join("observability/events.jsonl");
    warden_core::events::replay(&path)
        .await
        .expect("replay")
        .into_iter()
        .map(|r| r.kind.to_string())
        .collect()
}
