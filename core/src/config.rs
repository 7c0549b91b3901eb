//! Layered JSON configuration: `base.json` under the Warden home, then
//! `repo.json` and `env.local.json` under `<worktree>/.warden/`. Later
//! layers win key-by-key; unknown keys fail fast at startup.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::error::WardenErr;

const BASE_CONFIG_FILE: &str = "base.json";
const REPO_CONFIG_FILE: &str = "repo.json";
const ENV_LOCAL_CONFIG_FILE: &str = "env.local.json";

/// Default per-agent token budget and the threshold that flips a session
/// into `BLOCKED_BUDGET`.
const DEFAULT_MAX_TOKENS: u64 = 200_000;
const DEFAULT_THRESHOLD_TOKENS: u64 = 160_000;

const DEFAULT_FRICTION_THRESHOLD: u32 = 3;
const DEFAULT_CONTEST_WINDOW_HOURS: i64 = 48;
const DEFAULT_SANDBOX_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SANDBOX_MEMORY_CAP_MB: u64 = 256;
const DEFAULT_FETCH_MAX_RETRIES: u64 = 3;

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the target repository. All pack-scoped paths resolve
    /// against this directory.
    pub worktree_root: PathBuf,

    /// Directory holding all controller state (packs, artifact bundles,
    /// the event log, memory records). Defaults to `<tmp>/warden`.
    pub state_root: PathBuf,

    /// Drop folder for human memory overrides.
    pub overrides_dir: PathBuf,

    /// Drop folder for attachments.
    pub inbox_dir: PathBuf,

    pub max_tokens: u64,
    pub threshold_tokens: u64,

    /// Rejection count at which a pending memory candidate is scaffolded.
    pub friction_threshold: u32,

    /// Hours a pending memory stays contestable before auto-promotion.
    pub contest_window_hours: i64,

    pub sandbox: SandboxConfig,
    pub fetchers: FetcherConfig,
    pub recipes: Vec<RecipeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Interpreter argv the evaluator spawns; the expression is appended
    /// as the final argument.
    pub interpreter: Vec<String>,
    #[serde(default = "default_sandbox_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_sandbox_memory_cap_mb")]
    pub memory_cap_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["node".to_string(), "-e".to_string()],
            default_timeout_ms: DEFAULT_SANDBOX_TIMEOUT_MS,
            memory_cap_mb: DEFAULT_SANDBOX_MEMORY_CAP_MB,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FetcherConfig {
    /// Base URL of the ticket tracker; unset disables ticket fetches.
    #[serde(default)]
    pub ticket_base_url: Option<String>,
    /// Base URL of the API-spec service; unset disables spec fetches.
    #[serde(default)]
    pub api_spec_base_url: Option<String>,
    #[serde(default = "default_fetch_max_retries")]
    pub max_retries: u64,
}

/// A registered automation recipe: a named sequence of structured patch
/// steps over declared files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RecipeConfig {
    pub id: String,
    pub description: String,
    pub steps: Vec<RecipeStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeStep {
    pub target_file: String,
    #[serde(flatten)]
    pub op: warden_patch::PatchOp,
}

fn default_sandbox_timeout_ms() -> u64 {
    DEFAULT_SANDBOX_TIMEOUT_MS
}

fn default_sandbox_memory_cap_mb() -> u64 {
    DEFAULT_SANDBOX_MEMORY_CAP_MB
}

fn default_fetch_max_retries() -> u64 {
    DEFAULT_FETCH_MAX_RETRIES
}

/// The on-disk shape shared by all three layers. Every field is optional
/// here; required values are enforced after merging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ConfigFile {
    worktree_root: Option<PathBuf>,
    state_root: Option<PathBuf>,
    overrides_dir: Option<PathBuf>,
    inbox_dir: Option<PathBuf>,
    max_tokens: Option<u64>,
    threshold_tokens: Option<u64>,
    friction_threshold: Option<u32>,
    contest_window_hours: Option<i64>,
    sandbox: Option<SandboxConfig>,
    fetchers: Option<FetcherConfig>,
    recipes: Option<Vec<RecipeConfig>>,
}

/// Strongly-typed overrides applied on top of the merged layers.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub worktree_root: Option<PathBuf>,
    pub state_root: Option<PathBuf>,
    pub max_tokens: Option<u64>,
    pub threshold_tokens: Option<u64>,
}

impl Config {
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let warden_home = find_warden_home()?;

        // The repo layers live under the worktree, so the worktree must be
        // resolvable before layering: overrides win, then the base layer,
        // then the process cwd.
        let base_layer = load_layer(&warden_home.join(BASE_CONFIG_FILE))?;
        let worktree_root = overrides
            .worktree_root
            .clone()
            .or_else(|| {
                base_layer
                    .as_ref()
                    .and_then(|v| v.get("worktreeRoot"))
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from)
            })
            .or_else(|| std::env::current_dir().ok())
            .ok_or_else(|| WardenErr::Config("worktree root is not resolvable".to_string()))?;

        let mut merged = base_layer.unwrap_or_else(|| JsonValue::Object(Default::default()));
        let repo_dir = worktree_root.join(".warden");
        for file in [REPO_CONFIG_FILE, ENV_LOCAL_CONFIG_FILE] {
            if let Some(layer) = load_layer(&repo_dir.join(file))? {
                merge_layer(&mut merged, layer);
            }
        }

        let file: ConfigFile = serde_json::from_value(merged)
            .map_err(|e| WardenErr::Config(format!("invalid configuration: {e}")))?;

        let state_root = overrides
            .state_root
            .or(file.state_root)
            .unwrap_or_else(|| std::env::temp_dir().join("warden"));

        let config = Config {
            overrides_dir: file
                .overrides_dir
                .unwrap_or_else(|| worktree_root.join("memory").join("overrides")),
            inbox_dir: file
                .inbox_dir
                .unwrap_or_else(|| worktree_root.join("inbox")),
            worktree_root,
            state_root,
            max_tokens: overrides
                .max_tokens
                .or(file.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            threshold_tokens: overrides
                .threshold_tokens
                .or(file.threshold_tokens)
                .unwrap_or(DEFAULT_THRESHOLD_TOKENS),
            friction_threshold: file
                .friction_threshold
                .unwrap_or(DEFAULT_FRICTION_THRESHOLD),
            contest_window_hours: file
                .contest_window_hours
                .unwrap_or(DEFAULT_CONTEST_WINDOW_HOURS),
            sandbox: file.sandbox.unwrap_or_default(),
            fetchers: file.fetchers.unwrap_or_default(),
            recipes: file.recipes.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.threshold_tokens > self.max_tokens {
            return Err(WardenErr::Config(format!(
                "thresholdTokens ({}) must not exceed maxTokens ({})",
                self.threshold_tokens, self.max_tokens
            )));
        }
        if self.sandbox.interpreter.is_empty() {
            return Err(WardenErr::Config(
                "sandbox.interpreter must name an executable".to_string(),
            ));
        }
        if self.friction_threshold == 0 {
            return Err(WardenErr::Config(
                "frictionThreshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-work-unit directory under the state root.
    pub fn work_dir(&self, work_id: &str) -> PathBuf {
        self.state_root.join("work").join(work_id)
    }

    pub fn scratch_dir(&self, work_id: &str) -> PathBuf {
        self.work_dir(work_id).join("scratch")
    }

    pub fn attachments_dir(&self, work_id: &str) -> PathBuf {
        self.work_dir(work_id).join("attachments")
    }

    pub fn nodes_dir(&self, work_id: &str) -> PathBuf {
        self.work_dir(work_id).join("nodes")
    }

    pub fn pack_path(&self, work_id: &str) -> PathBuf {
        self.work_dir(work_id).join("context-pack.json")
    }

    pub fn recipe(&self, id: &str) -> Option<&RecipeConfig> {
        self.recipes.iter().find(|r| r.id == id)
    }
}

/// Resolve the directory that stores global Warden state (`~/.warden` or
/// the value of `$WARDEN_HOME`).
pub fn find_warden_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("WARDEN_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".warden"))
        .ok_or_else(|| WardenErr::Config("could not determine home directory".to_string()))
}

fn load_layer(path: &Path) -> Result<Option<JsonValue>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value: JsonValue = serde_json::from_str(&contents).map_err(|e| {
                WardenErr::Config(format!("failed to parse {}: {e}", path.display()))
            })?;
            if !value.is_object() {
                return Err(WardenErr::Config(format!(
                    "{} must contain a JSON object",
                    path.display()
                )));
            }
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WardenErr::Config(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Key-wise merge: objects merge recursively, anything else is replaced by
/// the later layer.
fn merge_layer(base: &mut JsonValue, layer: JsonValue) {
    match (base, layer) {
        (JsonValue::Object(base_map), JsonValue::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_layer(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, layer_value) => *base_slot = layer_value,
    }
}
