//! The enforcement bundle: memory `plan_rule` records and graph-derived
//! policy rules converted into one shape so a single evaluator handles
//! both. Bundles are built fresh per plan submission and never persisted.

use serde::Deserialize;
use serde::Serialize;
use wildmatch::WildMatch;

use crate::adapters::GraphAdapter;
use crate::memory::EnforcementType;
use crate::memory::MemoryRecord;
use warden_protocol::DenyCode;
use warden_protocol::PlanDocument;
use warden_protocol::PlanNode;
use warden_protocol::PlanNodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Memory,
    GraphPolicy,
}

/// One enforceable rule: every required step must be matched by at least
/// one plan node, otherwise the rule's deny code is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub required_steps: Vec<RequiredStep>,
    pub deny_code: String,
    #[serde(default = "default_rule_source")]
    pub source: RuleSource,
}

fn default_rule_source() -> RuleSource {
    RuleSource::GraphPolicy
}

/// Criteria a plan node must meet to satisfy one step. Unset criteria
/// match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredStep {
    #[serde(default)]
    pub kind: Option<PlanNodeKind>,
    #[serde(default)]
    pub citation: Option<String>,
    /// Wildcard pattern matched against the node's target file.
    #[serde(default)]
    pub target_pattern: Option<String>,
}

impl RequiredStep {
    fn matched_by(&self, node: &PlanNode) -> bool {
        if let Some(kind) = self.kind
            && node.kind != kind
        {
            return false;
        }
        if let Some(citation) = &self.citation
            && !node.citations.iter().any(|c| c == citation)
        {
            return false;
        }
        if let Some(pattern) = &self.target_pattern {
            let matcher = WildMatch::new(pattern);
            let target = node.target_file.as_deref().unwrap_or("");
            if !matcher.matches(target) {
                return false;
            }
        }
        true
    }
}

impl PlanRule {
    pub fn is_satisfied_by(&self, plan: &PlanDocument) -> bool {
        self.required_steps
            .iter()
            .all(|step| plan.nodes.iter().any(|node| step.matched_by(node)))
    }

    /// The configured deny code, constrained to the known families; rules
    /// with an out-of-family code fall back to the generic policy code.
    pub fn deny_code(&self) -> DenyCode {
        DenyCode::try_from(self.deny_code.clone()).unwrap_or(DenyCode::PlanPolicyViolation)
    }
}

/// Assemble the ephemeral bundle for one submission: active memory
/// `plan_rule` records first, then graph policy rules.
pub fn build_enforcement_bundle(
    memories: &[MemoryRecord],
    graph: &dyn GraphAdapter,
) -> Vec<PlanRule> {
    let mut bundle = Vec::new();
    for record in memories {
        if record.enforcement_type != EnforcementType::PlanRule || !record.is_active() {
            continue;
        }
        match serde_json::from_value::<PlanRule>(record.payload.clone()) {
            Ok(mut rule) => {
                rule.source = RuleSource::Memory;
                bundle.push(rule);
            }
            Err(e) => {
                tracing::warn!("memory record {} has malformed plan_rule payload: {e}", record.id);
            }
        }
    }
    for mut rule in graph.policy_rules() {
        rule.source = RuleSource::GraphPolicy;
        bundle.push(rule);
    }
    bundle
}

/// Evaluate the whole bundle; returns the deny codes of unmet rules.
pub fn evaluate_bundle(bundle: &[PlanRule], plan: &PlanDocument) -> Vec<DenyCode> {
    bundle
        .iter()
        .filter(|rule| !rule.is_satisfied_by(plan))
        .map(PlanRule::deny_code)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change_node(id: &str, target: &str, citations: &[&str]) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            kind: PlanNodeKind::Change,
            depends_on: vec![],
            atomicity_boundary: None,
            expected_failure_signatures: vec![],
            target_file: Some(target.to_string()),
            target_symbols: vec![],
            citations: citations.iter().map(|s| s.to_string()).collect(),
            artifact_refs: vec![],
            maps_to: vec![],
            command: None,
            commit_gate_id: None,
            effect: None,
            need: None,
            requested_evidence: vec![],
        }
    }

    fn plan_with(nodes: Vec<PlanNode>) -> PlanDocument {
        PlanDocument {
            plan_id: Some("p".into()),
            snapshot: None,
            pack_ref: None,
            pack_hash: None,
            policy_versions: None,
            scope_allow_list_ref: None,
            strategy: None,
            evidence_policy: None,
            schema_version: None,
            nodes,
        }
    }

    #[test]
    fn unmet_rule_emits_its_configured_code() {
        let rule = PlanRule {
            id: "needs-migration".into(),
            description: String::new(),
            required_steps: vec![RequiredStep {
                kind: Some(PlanNodeKind::Change),
                citation: None,
                target_pattern: Some("migrations/*".into()),
            }],
            deny_code: "PLAN_NEEDS_MIGRATION_STEP".into(),
            source: RuleSource::Memory,
        };

        let plan = plan_with(vec![change_node("c1", "src/app.ts", &[])]);
        let codes = evaluate_bundle(&[rule.clone()], &plan);
        assert_eq!(
            codes,
            vec![DenyCode::Rule("PLAN_NEEDS_MIGRATION_STEP".into())]
        );

        let satisfied = plan_with(vec![change_node("c1", "migrations/001.sql", &[])]);
        assert!(evaluate_bundle(&[rule], &satisfied).is_empty());
    }

    #[test]
    fn citation_steps_match_exact_tokens() {
        let rule = PlanRule {
            id: "codemod-only".into(),
            description: String::new(),
            required_steps: vec![RequiredStep {
                kind: None,
                citation: Some("codemod:rename_identifier_in_file".into()),
                target_pattern: None,
            }],
            deny_code: "PLAN_POLICY_VIOLATION".into(),
            source: RuleSource::GraphPolicy,
        };

        let plan = plan_with(vec![change_node(
            "c1",
            "src/app.ts",
            &["codemod:rename_identifier_in_file"],
        )]);
        assert!(evaluate_bundle(&[rule], &plan).is_empty());
    }

    #[test]
    fn out_of_family_codes_fall_back_to_policy_violation() {
        let rule = PlanRule {
            id: "broken".into(),
            description: String::new(),
            required_steps: vec![RequiredStep {
                kind: Some(PlanNodeKind::SideEffect),
                citation: None,
                target_pattern: None,
            }],
            deny_code: "TOTALLY_WRONG".into(),
            source: RuleSource::GraphPolicy,
        };
        let plan = plan_with(vec![change_node("c1", "src/app.ts", &[])]);
        assert_eq!(
            evaluate_bundle(&[rule], &plan),
            vec![DenyCode::PlanPolicyViolation]
        );
    }
}
