//! Narrow interfaces to the external collaborators: the code index, the
//! knowledge graph, the ticket / API-spec fetchers, and the glossary
//! expander. None of these participate in plan acceptance; they only feed
//! the ContextPack builder and the read verbs.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::FetcherConfig;
use crate::enforcement::PlanRule;
use crate::error::Result;
use crate::error::WardenErr;
use crate::util::backoff;

const INDEX_SNAPSHOT_FILE: &str = "index-snapshot.json";
const GRAPH_SNAPSHOT_FILE: &str = "graph-snapshot.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolEntry {
    pub name: String,
    /// `entrypoint`, `definition`, `type`, `route`, ...
    pub kind: String,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySeed {
    pub id: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub rule: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofLink {
    /// Node type within the chain (e.g. `Table`, `ColumnDef`).
    pub node_type: String,
    pub identifier: String,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextHit {
    pub file: String,
    pub line: usize,
    pub snippet: String,
}

/// Lexical/symbol lookups over a prepared index snapshot.
pub trait IndexAdapter: Send + Sync {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolEntry>;
    fn symbols_in_file(&self, file: &str) -> Vec<SymbolEntry>;
    /// Files scoring against the given lexemes, best first.
    fn lexical_candidates(&self, lexemes: &[String]) -> Vec<(String, f64)>;
    fn all_symbols(&self) -> Vec<SymbolEntry>;
}

/// Proof chains, policy seeds and symbol-graph walks.
pub trait GraphAdapter: Send + Sync {
    fn policy_seeds(&self) -> Vec<PolicySeed>;
    fn proof_chain(&self, kind: ProofChainKind) -> Option<Vec<ProofLink>>;
    fn trace_symbol(&self, name: &str, depth: usize) -> Vec<GraphEdge>;
    /// Graph-derived policy rules, converted to plan-rule shape for the
    /// enforcement bundle.
    fn policy_rules(&self) -> Vec<PlanRule>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofChainKind {
    UiOrigin,
    Federation,
}

// ---------------------------------------------------------------------------
// Snapshot-backed implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexSnapshot {
    #[serde(default)]
    symbols: Vec<SymbolEntry>,
    /// Optional lexeme → files hints prepared by the index builder.
    #[serde(default)]
    lexical: Vec<LexicalHint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LexicalHint {
    lexeme: String,
    files: Vec<String>,
}

pub struct SnapshotIndex {
    snapshot: IndexSnapshot,
}

impl SnapshotIndex {
    /// Load `<state>/index-snapshot.json`; a missing snapshot yields an
    /// empty index rather than an error.
    pub fn load(state_root: &Path) -> Result<Self> {
        let path = state_root.join(INDEX_SNAPSHOT_FILE);
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| WardenErr::Config(format!("corrupt index snapshot: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexSnapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { snapshot })
    }
}

impl IndexAdapter for SnapshotIndex {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolEntry> {
        self.snapshot.symbols.iter().find(|s| s.name == name).cloned()
    }

    fn symbols_in_file(&self, file: &str) -> Vec<SymbolEntry> {
        self.snapshot
            .symbols
            .iter()
            .filter(|s| s.file == file)
            .cloned()
            .collect()
    }

    fn lexical_candidates(&self, lexemes: &[String]) -> Vec<(String, f64)> {
        let mut scores: Vec<(String, f64)> = Vec::new();
        for hint in &self.snapshot.lexical {
            if lexemes.iter().any(|l| l.eq_ignore_ascii_case(&hint.lexeme)) {
                for file in &hint.files {
                    match scores.iter_mut().find(|(f, _)| f == file) {
                        Some((_, score)) => *score += 1.0,
                        None => scores.push((file.clone(), 1.0)),
                    }
                }
            }
        }
        // Deterministic order: score descending, then path ascending.
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores
    }

    fn all_symbols(&self) -> Vec<SymbolEntry> {
        self.snapshot.symbols.clone()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSnapshot {
    #[serde(default)]
    policy_seeds: Vec<PolicySeed>,
    #[serde(default)]
    ui_origin_chain: Vec<ProofLink>,
    #[serde(default)]
    federation_chain: Vec<ProofLink>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
    #[serde(default)]
    policy_rules: Vec<PlanRule>,
}

pub struct SnapshotGraph {
    snapshot: GraphSnapshot,
}

impl SnapshotGraph {
    pub fn load(state_root: &Path) -> Result<Self> {
        let path = state_root.join(GRAPH_SNAPSHOT_FILE);
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| WardenErr::Config(format!("corrupt graph snapshot: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GraphSnapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { snapshot })
    }
}

impl GraphAdapter for SnapshotGraph {
    fn policy_seeds(&self) -> Vec<PolicySeed> {
        self.snapshot.policy_seeds.clone()
    }

    fn proof_chain(&self, kind: ProofChainKind) -> Option<Vec<ProofLink>> {
        let chain = match kind {
            ProofChainKind::UiOrigin => &self.snapshot.ui_origin_chain,
            ProofChainKind::Federation => &self.snapshot.federation_chain,
        };
        if chain.is_empty() {
            None
        } else {
            Some(chain.clone())
        }
    }

    fn trace_symbol(&self, name: &str, depth: usize) -> Vec<GraphEdge> {
        let mut frontier = vec![name.to_string()];
        let mut result: Vec<GraphEdge> = Vec::new();
        for _ in 0..depth.max(1) {
            let mut next = Vec::new();
            for edge in &self.snapshot.edges {
                if frontier.contains(&edge.from)
                    && !result
                        .iter()
                        .any(|e| e.from == edge.from && e.to == edge.to)
                {
                    next.push(edge.to.clone());
                    result.push(edge.clone());
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        result
    }

    fn policy_rules(&self) -> Vec<PlanRule> {
        self.snapshot.policy_rules.clone()
    }
}

// ---------------------------------------------------------------------------
// External artifact fetchers
// ---------------------------------------------------------------------------

/// Ticket-tracker and API-spec fetches with bounded retries. Base URLs are
/// optional; an unset URL disables that fetcher.
pub struct ExternalFetchers {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl ExternalFetchers {
    pub fn new(config: FetcherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn fetch_ticket(&self, key: &str) -> Result<Option<JsonValue>> {
        let Some(base) = &self.config.ticket_base_url else {
            return Ok(None);
        };
        let url = format!("{}/{key}", base.trim_end_matches('/'));
        self.fetch_with_retries(&url).await.map(Some)
    }

    pub async fn fetch_api_spec(&self, reference: &str) -> Result<Option<JsonValue>> {
        let Some(base) = &self.config.api_spec_base_url else {
            return Ok(None);
        };
        let url = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            reference.replace(' ', "/").trim_start_matches('/')
        );
        self.fetch_with_retries(&url).await.map(Some)
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<JsonValue> {
        let max_retries = self.config.max_retries.max(1);
        for attempt in 1..=max_retries {
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json().await?);
                }
                Ok(response) => {
                    tracing::warn!("fetch {url}: unexpected status {}", response.status());
                }
                Err(e) => {
                    tracing::warn!("fetch {url} attempt {attempt} failed: {e}");
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        Err(WardenErr::RetryLimit(url.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Glossary
// ---------------------------------------------------------------------------

/// Deterministic query expansion over a fixed alias table.
pub struct StaticGlossary {
    aliases: Vec<(String, Vec<String>)>,
}

impl Default for StaticGlossary {
    fn default() -> Self {
        let aliases = [
            ("grid", &["table", "datagrid"][..]),
            ("column", &["columndef", "field"]),
            ("federation", &["remote", "module-federation"]),
            ("endpoint", &["route", "api"]),
        ];
        Self {
            aliases: aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }
}

impl StaticGlossary {
    pub fn expand(&self, lexemes: &[String]) -> Vec<String> {
        let mut expanded = Vec::new();
        for lexeme in lexemes {
            for (key, values) in &self.aliases {
                if lexeme.eq_ignore_ascii_case(key) {
                    for value in values {
                        if !expanded.contains(value) && !lexemes.contains(value) {
                            expanded.push(value.clone());
                        }
                    }
                }
            }
        }
        expanded
    }
}

/// Scratch path resolution shared by the read verbs: reject absolute paths
/// and any traversal outside the root.
pub fn resolve_under_root(root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}
