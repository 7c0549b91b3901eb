use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// A submitted execution plan. Envelope-level fields are optional at the
/// parse layer so an incomplete document still parses and earns
/// `PLAN_MISSING_REQUIRED_FIELDS` from the validator instead of a parse
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Identifier of the repository snapshot the plan was authored against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_versions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_allow_list_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<PlanStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_policy: Option<EvidencePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStrategy {
    pub id: String,
    #[serde(default)]
    pub reasons: Vec<StrategyReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyReason {
    pub claim: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRef {
    pub category: EvidenceCategory,
    /// File path, policy id, or requirement key this evidence points at.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvidenceCategory {
    Requirement,
    Code,
    Policy,
}

/// Per-category evidence minima plus the single-source escape hatch, which
/// is only honored when both guard fields are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidencePolicy {
    #[serde(default)]
    pub requirement_min: u32,
    #[serde(default)]
    pub code_min: u32,
    #[serde(default)]
    pub policy_min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_source: Option<SingleSourceGuard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSourceGuard {
    pub justification: String,
    pub approved_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanNodeKind {
    Change,
    Validate,
    Escalate,
    SideEffect,
}

/// One node of the plan DAG. Kind-specific fields are flat optionals; the
/// validator enforces which must be present for each kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub id: String,
    pub kind: PlanNodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atomicity_boundary: Option<AtomicityBoundary>,
    #[serde(default)]
    pub expected_failure_signatures: Vec<String>,

    // change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
    #[serde(default)]
    pub target_symbols: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub artifact_refs: Vec<String>,

    // validate
    #[serde(default)]
    pub maps_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    // side_effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_gate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    // escalate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need: Option<String>,
    #[serde(default)]
    pub requested_evidence: Vec<RequestedEvidence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicityBoundary {
    #[serde(default)]
    pub in_scope: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// A typed evidence request carried by `escalate` (both the verb and the
/// plan node kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedEvidence {
    pub kind: RequestedEvidenceKind,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestedEvidenceKind {
    File,
    Symbol,
    Policy,
    ProofChain,
    Artifact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn incomplete_document_still_parses() {
        let doc: PlanDocument =
            serde_json::from_str(r#"{"nodes":[{"id":"n1","kind":"change"}]}"#).expect("parse");
        assert!(doc.plan_id.is_none());
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0].kind, PlanNodeKind::Change);
    }

    #[test]
    fn node_kind_wire_spelling() {
        let kind: PlanNodeKind = serde_json::from_str("\"side_effect\"").expect("parse");
        assert_eq!(kind, PlanNodeKind::SideEffect);
    }
}
