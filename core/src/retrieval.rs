//! Deterministic retrieval: prompt lexemes → context signature, strategy
//! selection, the five retrieval lanes with stable reranking, proof-chain
//! requirements, and the external-artifact prompt patterns. No step here
//! interprets natural language beyond lexeme matching.

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;

use crate::memory::EnforcementType;
use crate::memory::MemoryRecord;
use warden_protocol::ContextSignature;

const UI_GRID_LEXEMES: &[&str] = &["grid", "table", "column", "cell", "row", "datagrid"];
const FEDERATION_LEXEMES: &[&str] = &["federation", "remote", "expose", "host", "microfrontend"];
const MIGRATION_LEXEMES: &[&str] = &["migration", "migrate", "schema", "backfill"];
const API_CONTRACT_LEXEMES: &[&str] = &["api", "endpoint", "contract", "openapi", "swagger"];
const DEBUG_SYMPTOM_LEXEMES: &[&str] = &["error", "crash", "undefined", "nan", "stacktrace", "regression"];

/// The typed node sequence required when grid signals are present.
pub const UI_ORIGIN_CHAIN: &[&str] = &[
    "Table",
    "ColumnDef",
    "CellRenderer",
    "NavTrigger",
    "Route",
    "Component",
];

/// The typed node sequence required when federation signals are present.
pub const FEDERATION_CHAIN: &[&str] = &["Host", "mapping", "expose", "remote", "destination"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetrievalLane {
    Lexical,
    Symbol,
    Policy,
    Artifact,
    EpisodicMemory,
}

/// One reranked retrieval decision, recorded in the pack trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalDecision {
    pub lane: RetrievalLane,
    pub item: String,
    pub score: f64,
    pub reason: String,
}

/// Lowercased word lexemes of the prompt, deduplicated in order.
pub fn lexemes_of(prompt: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in prompt
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_ascii_lowercase();
        if !out.contains(&lower) {
            out.push(lower);
        }
    }
    out
}

fn any_lexeme(lexemes: &[String], set: &[&str]) -> bool {
    lexemes.iter().any(|l| set.contains(&l.as_str()))
}

/// Boolean features computed from the prompt alone. Memory overrides are
/// applied afterwards by [`apply_strategy_overrides`].
pub fn compute_signature(prompt: &str) -> ContextSignature {
    let lexemes = lexemes_of(prompt);
    ContextSignature {
        ui_grid: any_lexeme(&lexemes, UI_GRID_LEXEMES),
        federation: any_lexeme(&lexemes, FEDERATION_LEXEMES),
        migration_in_play: any_lexeme(&lexemes, MIGRATION_LEXEMES),
        api_contract: any_lexeme(&lexemes, API_CONTRACT_LEXEMES),
        debug_symptom: any_lexeme(&lexemes, DEBUG_SYMPTOM_LEXEMES),
    }
}

/// Apply `strategy_signal` memory overrides to the computed signature.
/// Each override payload names a feature and the value to force; the
/// returned reasons record which memory flipped what.
pub fn apply_strategy_overrides(
    mut signature: ContextSignature,
    memories: &[MemoryRecord],
) -> (ContextSignature, Vec<String>) {
    let mut reasons = Vec::new();
    for record in memories {
        if record.enforcement_type != EnforcementType::StrategySignal || !record.is_active() {
            continue;
        }
        let Some(feature) = record.payload.get("feature").and_then(JsonValue::as_str) else {
            continue;
        };
        let value = record
            .payload
            .get("value")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        let slot = match feature {
            "uiGrid" => &mut signature.ui_grid,
            "federation" => &mut signature.federation,
            "migrationInPlay" => &mut signature.migration_in_play,
            "apiContract" => &mut signature.api_contract,
            "debugSymptom" => &mut signature.debug_symptom,
            other => {
                tracing::warn!("memory {} overrides unknown feature {other}", record.id);
                continue;
            }
        };
        if *slot != value {
            *slot = value;
            reasons.push(format!("memory:{} forced {feature}={value}", record.id));
        }
    }
    (signature, reasons)
}

/// Deterministic strategy selection from the final signature.
pub fn strategy_for(signature: &ContextSignature) -> (String, Vec<String>) {
    let mut reasons = Vec::new();
    let id = if signature.ui_grid {
        reasons.push("grid lexemes demand the UI-origin proof chain".to_string());
        "ui_origin_proof"
    } else if signature.federation {
        reasons.push("federation lexemes demand the federation proof chain".to_string());
        "federation_proof"
    } else if signature.migration_in_play {
        reasons.push("migration lexemes demand paired schema steps".to_string());
        "migration_guarded"
    } else if signature.api_contract {
        reasons.push("api lexemes demand contract evidence".to_string());
        "api_contract_first"
    } else if signature.debug_symptom {
        reasons.push("symptom lexemes demand a reproduction validate node".to_string());
        "repro_first"
    } else {
        reasons.push("no special signals; baseline retrieval".to_string());
        "baseline"
    };
    (id.to_string(), reasons)
}

/// Merge lane candidates and rerank deterministically: score descending,
/// then lane order, then item path. Ties never depend on map iteration
/// order.
pub fn rerank(mut decisions: Vec<RetrievalDecision>) -> Vec<RetrievalDecision> {
    fn lane_rank(lane: RetrievalLane) -> u8 {
        match lane {
            RetrievalLane::Lexical => 0,
            RetrievalLane::Symbol => 1,
            RetrievalLane::Policy => 2,
            RetrievalLane::Artifact => 3,
            RetrievalLane::EpisodicMemory => 4,
        }
    }
    decisions.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| lane_rank(a.lane).cmp(&lane_rank(b.lane)))
            .then_with(|| a.item.cmp(&b.item))
    });
    decisions
}

/// First ticket key in the prompt (`ABC-123` style), if any.
pub fn find_ticket_key(prompt: &str) -> Option<String> {
    let pattern = Regex::new(r"\b[A-Z][A-Z0-9]+-[0-9]+\b").ok()?;
    pattern.find(prompt).map(|m| m.as_str().to_string())
}

/// First API reference in the prompt (`GET /orders/{id}` style), if any.
pub fn find_api_ref(prompt: &str) -> Option<String> {
    let pattern = Regex::new(r"\b(GET|POST|PUT|PATCH|DELETE)\s+(/[A-Za-z0-9_{}/.-]*)").ok()?;
    pattern
        .captures(prompt)
        .map(|c| format!("{} {}", &c[1], &c[2]))
}

/// Folder-derived domain anchors for a set of repository-relative paths:
/// the first two path components, deduplicated and sorted.
pub fn derive_anchors(files: &[String]) -> Vec<String> {
    let mut anchors: Vec<String> = Vec::new();
    for file in files {
        let mut components = std::path::Path::new(file).components();
        let mut anchor = String::new();
        for _ in 0..2 {
            if let Some(std::path::Component::Normal(part)) = components.next() {
                if components.clone().next().is_none() {
                    // Last component is the file name; stop at its folder.
                    break;
                }
                if !anchor.is_empty() {
                    anchor.push('/');
                }
                anchor.push_str(&part.to_string_lossy());
            }
        }
        if !anchor.is_empty() && !anchors.contains(&anchor) {
            anchors.push(anchor);
        }
    }
    anchors.sort();
    anchors
}
