//! The sealed ContextPack: the single authoritative on-disk scope artifact
//! for a work unit. Built deterministically at `initialize_work`, grown
//! monotonically by `escalate`, rewritten atomically, content-hashed.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha1::Digest;
use sha1::Sha1;

use crate::adapters::ExternalFetchers;
use crate::adapters::GraphAdapter;
use crate::adapters::IndexAdapter;
use crate::adapters::PolicySeed;
use crate::adapters::ProofChainKind;
use crate::adapters::ProofLink;
use crate::adapters::StaticGlossary;
use crate::adapters::SymbolEntry;
use crate::config::Config;
use crate::error::Result;
use crate::memory::MemoryRecord;
use crate::retrieval;
use crate::retrieval::RetrievalDecision;
use crate::retrieval::RetrievalLane;
use warden_protocol::ContextSignature;
use warden_protocol::EvidencePolicy;
use warden_protocol::PackInsufficiency;
use warden_protocol::PlanNodeKind;
use warden_protocol::RequestedEvidence;
use warden_protocol::RequestedEvidenceKind;

/// Ordered, append-only file allow-list with a membership set. Growth is
/// monotonic across the pack's lifetime; nothing ever removes an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct FileAllowList {
    entries: Vec<String>,
    members: HashSet<String>,
}

impl FileAllowList {
    pub fn contains(&self, file: &str) -> bool {
        self.members.contains(file)
    }

    /// Append if absent; returns whether the entry was new.
    pub fn push(&mut self, file: String) -> bool {
        if self.members.contains(&file) {
            return false;
        }
        self.members.insert(file.clone());
        self.entries.push(file);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.entries
    }
}

impl From<Vec<String>> for FileAllowList {
    fn from(entries: Vec<String>) -> Self {
        let mut list = FileAllowList::default();
        for entry in entries {
            list.push(entry);
        }
        list
    }
}

impl From<FileAllowList> for Vec<String> {
    fn from(list: FileAllowList) -> Self {
        list.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub path: PathBuf,
    /// Where the attachment came from (`inbox`, `ticket`, `api_spec`).
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofChains {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_origin: Option<Vec<ProofLink>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<Vec<ProofLink>>,
}

/// What the validator will demand of a submitted plan: active validators,
/// expected node kinds, per-kind required fields, evidence minima, and
/// citation tokens the strategy requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGraphSchema {
    pub active_validators: Vec<String>,
    pub expected_node_kinds: Vec<PlanNodeKind>,
    pub required_fields: BTreeMap<String, Vec<String>>,
    pub evidence_policy: EvidencePolicy,
    pub required_citations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPack {
    pub work_id: String,
    pub created_at: DateTime<Utc>,
    pub files: FileAllowList,
    pub symbols: Vec<SymbolEntry>,
    pub retrieval_trace: Vec<RetrievalDecision>,
    pub query_expansion: Vec<String>,
    pub policies: Vec<PolicySeed>,
    pub memories: Vec<MemoryRecord>,
    pub attachments: Vec<AttachmentRef>,
    pub proof_chains: ProofChains,
    pub signature: ContextSignature,
    pub strategy_id: String,
    pub strategy_reasons: Vec<String>,
    pub plan_graph_schema: PlanGraphSchema,
    /// Hex SHA-1 over the serialized payload with this field blanked.
    pub hash: String,
}

impl ContextPack {
    /// The hash is a pure function of the serialized payload.
    pub fn compute_hash(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let payload = serde_json::to_vec(&unsealed)?;
        let digest = Sha1::digest(&payload);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Ok(hex)
    }

    pub fn seal(&mut self) -> Result<()> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.compute_hash()? == self.hash)
    }

    /// Atomic rewrite: serialize to a temp file in the target directory,
    /// then rename over the destination.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::fs::write(tmp.path(), &json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Readiness invariants; `Err` carries the typed insufficiency detail.
    pub fn readiness(&self) -> std::result::Result<(), PackInsufficiency> {
        let mut missing = Vec::new();
        if !self.symbols.iter().any(|s| s.kind == "entrypoint") {
            missing.push("entrypoint".to_string());
        }
        if !self.symbols.iter().any(|s| s.kind == "definition") {
            missing.push("definition".to_string());
        }
        if self.signature.ui_grid && self.proof_chains.ui_origin.is_none() {
            missing.push("proof_chain:ui_origin".to_string());
        }
        if self.signature.federation && self.proof_chains.federation.is_none() {
            missing.push("proof_chain:federation".to_string());
        }
        if self.plan_graph_schema.active_validators.is_empty() {
            missing.push("validation_plan".to_string());
        }
        if missing.is_empty() {
            return Ok(());
        }
        Err(PackInsufficiency {
            missing_anchors: missing,
            escalation_plan: "escalate with typed requestedEvidence for each missing anchor"
                .to_string(),
            blocked_commands: vec![
                "submit_execution_plan".to_string(),
                "apply_code_patch".to_string(),
                "run_sandboxed_code".to_string(),
                "execute_gated_side_effect".to_string(),
                "run_automation_recipe".to_string(),
            ],
            next_required_state: "PLANNING".to_string(),
        })
    }
}

/// Summary of what an enrichment added; the allow-list never shrinks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentDelta {
    pub added_files: Vec<String>,
    pub added_symbols: Vec<String>,
    pub schema_augmented: bool,
    pub new_hash: String,
}

pub struct PackInputs<'a> {
    pub config: &'a Config,
    pub work_id: &'a str,
    pub prompt: &'a str,
    pub memories: Vec<MemoryRecord>,
    pub attachments: Vec<AttachmentRef>,
    pub index: &'a dyn IndexAdapter,
    pub graph: &'a dyn GraphAdapter,
    pub fetchers: &'a ExternalFetchers,
    pub glossary: &'a StaticGlossary,
}

/// Build the pack in the spec's strict construction order. Override
/// ingestion has already happened by the time `memories` arrives here.
pub async fn build_pack(inputs: PackInputs<'_>) -> Result<ContextPack> {
    let PackInputs {
        config: _,
        work_id,
        prompt,
        memories,
        mut attachments,
        index,
        graph,
        fetchers,
        glossary,
    } = inputs;

    // Signature from prompt lexemes, then strategy_signal overrides.
    let base_signature = retrieval::compute_signature(prompt);
    let (signature, override_reasons) =
        retrieval::apply_strategy_overrides(base_signature, &memories);
    let (strategy_id, mut strategy_reasons) = retrieval::strategy_for(&signature);
    strategy_reasons.extend(override_reasons);

    let lexemes = retrieval::lexemes_of(prompt);
    let query_expansion = glossary.expand(&lexemes);
    let mut expanded_lexemes = lexemes.clone();
    expanded_lexemes.extend(query_expansion.iter().cloned());

    // Assemble the retrieval lanes.
    let mut decisions: Vec<RetrievalDecision> = Vec::new();
    let mut files = FileAllowList::default();
    let mut symbols: Vec<SymbolEntry> = Vec::new();

    for (file, score) in index.lexical_candidates(&expanded_lexemes) {
        decisions.push(RetrievalDecision {
            lane: RetrievalLane::Lexical,
            item: file.clone(),
            score,
            reason: "lexeme overlap with prompt".to_string(),
        });
        files.push(file.clone());
        for symbol in index.symbols_in_file(&file) {
            decisions.push(RetrievalDecision {
                lane: RetrievalLane::Symbol,
                item: format!("{}#{}", symbol.file, symbol.name),
                score,
                reason: "declared in a lexical candidate".to_string(),
            });
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
    }

    let policies = graph.policy_seeds();
    for seed in &policies {
        decisions.push(RetrievalDecision {
            lane: RetrievalLane::Policy,
            item: seed.id.clone(),
            score: 0.5,
            reason: "grounded policy seed".to_string(),
        });
    }

    for record in &memories {
        decisions.push(RetrievalDecision {
            lane: RetrievalLane::EpisodicMemory,
            item: record.id.clone(),
            score: 0.25,
            reason: format!("active memory ({:?})", record.enforcement_type),
        });
    }

    // Proof chains, resolved only when the corresponding signal is set.
    let mut proof_chains = ProofChains::default();
    if signature.ui_grid
        && let Some(chain) = graph.proof_chain(ProofChainKind::UiOrigin)
    {
        for link in &chain {
            files.push(link.file.clone());
        }
        proof_chains.ui_origin = Some(chain);
    }
    if signature.federation
        && let Some(chain) = graph.proof_chain(ProofChainKind::Federation)
    {
        for link in &chain {
            files.push(link.file.clone());
        }
        proof_chains.federation = Some(chain);
    }

    // External artifacts when the prompt carries a ticket key or an API
    // reference.
    if let Some(key) = retrieval::find_ticket_key(prompt)
        && let Some(_body) = fetchers.fetch_ticket(&key).await?
    {
        decisions.push(RetrievalDecision {
            lane: RetrievalLane::Artifact,
            item: key.clone(),
            score: 0.75,
            reason: "ticket key in prompt".to_string(),
        });
        attachments.push(AttachmentRef {
            id: key.clone(),
            path: PathBuf::from(format!("tickets/{key}.json")),
            source: "ticket".to_string(),
        });
    }
    if let Some(api_ref) = retrieval::find_api_ref(prompt)
        && let Some(_body) = fetchers.fetch_api_spec(&api_ref).await?
    {
        decisions.push(RetrievalDecision {
            lane: RetrievalLane::Artifact,
            item: api_ref.clone(),
            score: 0.75,
            reason: "api reference in prompt".to_string(),
        });
        attachments.push(AttachmentRef {
            id: api_ref.clone(),
            path: PathBuf::from("api-spec.json"),
            source: "api_spec".to_string(),
        });
    }

    let plan_graph_schema = compute_schema(&signature, &strategy_id);

    let mut pack = ContextPack {
        work_id: work_id.to_string(),
        created_at: Utc::now(),
        files,
        symbols,
        retrieval_trace: retrieval::rerank(decisions),
        query_expansion,
        policies,
        memories,
        attachments,
        proof_chains,
        signature,
        strategy_id,
        strategy_reasons,
        plan_graph_schema,
        hash: String::new(),
    };
    pack.seal()?;
    Ok(pack)
}

pub(crate) fn compute_schema(signature: &ContextSignature, strategy_id: &str) -> PlanGraphSchema {
    let mut active_validators = vec![
        "envelope".to_string(),
        "structure".to_string(),
        "scope".to_string(),
        "evidence".to_string(),
        "citations".to_string(),
        "enforcement".to_string(),
    ];
    let mut required_citations = Vec::new();
    if signature.ui_grid {
        active_validators.push("proof_chain".to_string());
        required_citations.push("proof:ui_origin".to_string());
    }
    if signature.federation {
        active_validators.push("proof_chain".to_string());
        required_citations.push("proof:federation".to_string());
    }
    active_validators.dedup();

    let mut required_fields = BTreeMap::new();
    required_fields.insert(
        "change".to_string(),
        vec!["targetFile".to_string(), "citations".to_string()],
    );
    required_fields.insert(
        "validate".to_string(),
        vec!["mapsTo".to_string(), "command".to_string()],
    );
    required_fields.insert(
        "side_effect".to_string(),
        vec!["commitGateId".to_string(), "effect".to_string()],
    );
    required_fields.insert("escalate".to_string(), vec!["need".to_string()]);

    // Evidence minima tighten for migration and contract work.
    let evidence_policy = EvidencePolicy {
        requirement_min: if strategy_id == "api_contract_first" { 2 } else { 1 },
        code_min: 2,
        policy_min: if strategy_id == "migration_guarded" { 1 } else { 0 },
        single_source: None,
    };

    PlanGraphSchema {
        active_validators,
        expected_node_kinds: vec![
            PlanNodeKind::Change,
            PlanNodeKind::Validate,
            PlanNodeKind::Escalate,
            PlanNodeKind::SideEffect,
        ],
        required_fields,
        evidence_policy,
        required_citations,
    }
}

/// Union the requested evidence into the pack, recompute the hash, and
/// report the delta. The allow-list never shrinks.
pub fn enrich_pack(
    pack: &mut ContextPack,
    need: &str,
    requested: &[RequestedEvidence],
    index: &dyn IndexAdapter,
    graph: &dyn GraphAdapter,
) -> Result<EnrichmentDelta> {
    let mut delta = EnrichmentDelta::default();

    for request in requested {
        match request.kind {
            RequestedEvidenceKind::File => {
                if pack.files.push(request.reference.clone()) {
                    delta.added_files.push(request.reference.clone());
                    for symbol in index.symbols_in_file(&request.reference) {
                        if !pack.symbols.contains(&symbol) {
                            delta.added_symbols.push(symbol.name.clone());
                            pack.symbols.push(symbol);
                        }
                    }
                }
            }
            RequestedEvidenceKind::Symbol => {
                if let Some(symbol) = index.lookup_symbol(&request.reference) {
                    if pack.files.push(symbol.file.clone()) {
                        delta.added_files.push(symbol.file.clone());
                    }
                    if !pack.symbols.contains(&symbol) {
                        delta.added_symbols.push(symbol.name.clone());
                        pack.symbols.push(symbol);
                    }
                }
            }
            RequestedEvidenceKind::Policy => {
                if !pack.policies.iter().any(|p| p.id == request.reference) {
                    for seed in graph.policy_seeds() {
                        if seed.id == request.reference {
                            pack.policies.push(seed);
                        }
                    }
                }
            }
            RequestedEvidenceKind::ProofChain => {
                let kind = match request.reference.as_str() {
                    "ui_origin" => Some(ProofChainKind::UiOrigin),
                    "federation" => Some(ProofChainKind::Federation),
                    _ => None,
                };
                if let Some(kind) = kind
                    && let Some(chain) = graph.proof_chain(kind)
                {
                    for link in &chain {
                        if pack.files.push(link.file.clone()) {
                            delta.added_files.push(link.file.clone());
                        }
                    }
                    match kind {
                        ProofChainKind::UiOrigin => {
                            if pack.proof_chains.ui_origin.is_none() {
                                pack.proof_chains.ui_origin = Some(chain);
                                pack.plan_graph_schema
                                    .required_citations
                                    .push("proof:ui_origin".to_string());
                                delta.schema_augmented = true;
                            }
                        }
                        ProofChainKind::Federation => {
                            if pack.proof_chains.federation.is_none() {
                                pack.proof_chains.federation = Some(chain);
                                pack.plan_graph_schema
                                    .required_citations
                                    .push("proof:federation".to_string());
                                delta.schema_augmented = true;
                            }
                        }
                    }
                }
            }
            RequestedEvidenceKind::Artifact => {
                if !pack.attachments.iter().any(|a| a.id == request.reference) {
                    pack.attachments.push(AttachmentRef {
                        id: request.reference.clone(),
                        path: PathBuf::from(format!("requested/{}", request.reference)),
                        source: "escalation".to_string(),
                    });
                }
            }
        }
    }

    pack.strategy_reasons.push(format!("enriched: {need}"));
    pack.seal()?;
    delta.new_hash = pack.hash.clone();
    Ok(delta)
}

/// Copy inbox drop-folder files under the work unit's attachments
/// directory and return their refs.
pub fn ingest_inbox(config: &Config, work_id: &str) -> Result<Vec<AttachmentRef>> {
    let entries = match std::fs::read_dir(&config.inbox_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let dest_dir = config.attachments_dir(work_id);
    std::fs::create_dir_all(&dest_dir)?;

    let mut refs = Vec::new();
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    for path in paths {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let dest = dest_dir.join(&name);
        std::fs::copy(&path, &dest)?;
        refs.push(AttachmentRef {
            id: format!("attachment:{name}"),
            path: dest,
            source: "inbox".to_string(),
        });
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_pack() -> ContextPack {
        ContextPack {
            work_id: "w1".to_string(),
            created_at: Utc::now(),
            files: FileAllowList::from(vec!["src/a.ts".to_string()]),
            symbols: vec![
                SymbolEntry {
                    name: "main".to_string(),
                    kind: "entrypoint".to_string(),
                    file: "src/a.ts".to_string(),
                },
                SymbolEntry {
                    name: "TargetSymbol".to_string(),
                    kind: "definition".to_string(),
                    file: "src/a.ts".to_string(),
                },
            ],
            retrieval_trace: vec![],
            query_expansion: vec![],
            policies: vec![],
            memories: vec![],
            attachments: vec![],
            proof_chains: ProofChains::default(),
            signature: ContextSignature::default(),
            strategy_id: "baseline".to_string(),
            strategy_reasons: vec![],
            plan_graph_schema: compute_schema(&ContextSignature::default(), "baseline"),
            hash: String::new(),
        }
    }

    #[test]
    fn hash_is_pure_function_of_payload() {
        let mut pack = minimal_pack();
        pack.seal().expect("seal");
        assert!(pack.verify_hash().expect("verify"));

        let hash_before = pack.hash.clone();
        pack.files.push("src/b.ts".to_string());
        pack.seal().expect("seal");
        assert_ne!(pack.hash, hash_before);
    }

    #[test]
    fn allow_list_growth_is_monotonic_and_deduplicated() {
        let mut list = FileAllowList::default();
        assert!(list.push("a.ts".to_string()));
        assert!(!list.push("a.ts".to_string()));
        assert!(list.push("b.ts".to_string()));
        assert_eq!(list.as_slice(), ["a.ts".to_string(), "b.ts".to_string()]);
    }

    #[test]
    fn readiness_demands_anchors_and_chains() {
        let mut pack = minimal_pack();
        assert!(pack.readiness().is_ok());

        pack.signature.ui_grid = true;
        let insufficiency = pack.readiness().expect_err("missing chain");
        assert!(
            insufficiency
                .missing_anchors
                .contains(&"proof_chain:ui_origin".to_string())
        );
        assert!(
            insufficiency
                .blocked_commands
                .contains(&"submit_execution_plan".to_string())
        );

        pack.symbols.clear();
        let insufficiency = pack.readiness().expect_err("missing anchors");
        assert!(insufficiency.missing_anchors.contains(&"entrypoint".to_string()));
    }

    #[test]
    fn atomic_write_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pack = minimal_pack();
        pack.seal().expect("seal");
        let path = dir.path().join("context-pack.json");
        pack.write_atomic(&path).expect("write");

        let loaded = ContextPack::load(&path).expect("load");
        assert_eq!(loaded.hash, pack.hash);
        assert!(loaded.verify_hash().expect("verify"));
        assert!(loaded.files.contains("src/a.ts"));
    }
}
