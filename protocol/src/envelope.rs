use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::DenyCode;
use crate::SessionState;

/// The response envelope returned by every `controller_turn`, regardless of
/// verb or outcome. Field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub run_session_id: String,
    pub work_id: String,
    pub agent_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TurnOutcome>,
    pub capabilities: Vec<String>,
    pub verb_descriptions: BTreeMap<String, VerbDescriptor>,
    pub scope: ScopeInfo,
    pub result: JsonValue,
    pub deny_reasons: Vec<DenyCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    pub knowledge_strategy: KnowledgeStrategy,
    pub budget_status: BudgetStatus,
    pub trace_ref: String,
    pub schema_version: String,
    pub sub_agent_hints: SubAgentHints,
    pub progress: ProgressSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_insufficiency: Option<PackInsufficiency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Ok,
    Denied,
}

/// Contract card for one verb, returned in every envelope so the agent
/// never needs out-of-band knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbDescriptor {
    pub description: String,
    pub when_to_use: String,
    pub required_args: Vec<String>,
    pub optional_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub worktree_root: PathBuf,
    pub scratch_root: PathBuf,
}

/// Deterministic boolean features extracted from the prompt lexemes, after
/// `strategy_signal` memory overrides have been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSignature {
    pub ui_grid: bool,
    pub federation: bool,
    pub migration_in_play: bool,
    pub api_contract: bool,
    pub debug_symptom: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStrategy {
    pub id: String,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_signature: Option<ContextSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub max: u64,
    pub used: u64,
    pub threshold: u64,
    pub blocked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentHints {
    pub recommended: bool,
    pub suggested_splits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    pub pending_validations: Vec<String>,
}

/// Typed detail returned when the ContextPack cannot satisfy its readiness
/// invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackInsufficiency {
    pub missing_anchors: Vec<String>,
    pub escalation_plan: String,
    pub blocked_commands: Vec<String>,
    pub next_required_state: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_serializes_camel_case() {
        let envelope = ResponseEnvelope {
            run_session_id: "rs".into(),
            work_id: "w".into(),
            agent_id: "a".into(),
            state: SessionState::Planning,
            outcome: Some(TurnOutcome::Ok),
            capabilities: vec!["escalate".into()],
            verb_descriptions: BTreeMap::new(),
            scope: ScopeInfo {
                worktree_root: PathBuf::from("/repo"),
                scratch_root: PathBuf::from("/tmp/work/w/scratch"),
            },
            result: serde_json::json!({}),
            deny_reasons: vec![],
            suggested_action: None,
            knowledge_strategy: KnowledgeStrategy {
                id: "default".into(),
                reasons: vec![],
                context_signature: None,
            },
            budget_status: BudgetStatus {
                max: 100,
                used: 1,
                threshold: 80,
                blocked: false,
            },
            trace_ref: "t".into(),
            schema_version: crate::ENVELOPE_SCHEMA_VERSION.into(),
            sub_agent_hints: SubAgentHints::default(),
            progress: ProgressSummary::default(),
            pack_insufficiency: None,
            original_prompt: Some("fix the grid".into()),
        };

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["runSessionId"], "rs");
        assert_eq!(value["state"], "PLANNING");
        assert_eq!(value["budgetStatus"]["threshold"], 80);
        assert_eq!(value["originalPrompt"], "fix the grid");
        assert!(value.get("packInsufficiency").is_none());
    }
}
