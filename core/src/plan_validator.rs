//! Plan-graph validation. Acceptance is all-or-nothing, but every check
//! runs so the client receives the complete set of matching codes in one
//! pass.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::context_pack::ContextPack;
use crate::enforcement;
use crate::enforcement::PlanRule;
use warden_patch::is_registered_codemod;
use warden_patch::lookup_codemod;
use warden_patch::parse_codemod_citation;
use warden_protocol::DenyCode;
use warden_protocol::EvidenceCategory;
use warden_protocol::PlanDocument;
use warden_protocol::PlanNode;
use warden_protocol::PlanNodeKind;

pub struct ValidationInput<'a> {
    pub plan: &'a PlanDocument,
    pub pack: &'a ContextPack,
    pub bundle: &'a [PlanRule],
    pub worktree_root: &'a Path,
    pub scratch_root: &'a Path,
}

/// Run every validator and return the deduplicated code set; empty means
/// the plan is accepted.
pub fn validate_plan(input: ValidationInput<'_>) -> Vec<DenyCode> {
    let mut codes = Vec::new();

    check_envelope(input.plan, input.pack, &mut codes);
    check_structure(input.plan, &mut codes);
    check_kind_fields(input.plan, &mut codes);
    check_scope(input.plan, input.pack, input.worktree_root, input.scratch_root, &mut codes);
    check_evidence(input.plan, input.pack, &mut codes);
    check_strategy(input.plan, input.pack, &mut codes);
    check_citations(input.plan, input.pack, &mut codes);
    check_attachment_linkage(input.plan, &mut codes);
    codes.extend(enforcement::evaluate_bundle(input.bundle, input.plan));

    dedup(codes)
}

fn dedup(codes: Vec<DenyCode>) -> Vec<DenyCode> {
    let mut seen = HashSet::new();
    codes.into_iter().filter(|c| seen.insert(c.clone())).collect()
}

fn check_envelope(plan: &PlanDocument, pack: &ContextPack, codes: &mut Vec<DenyCode>) {
    let complete = plan.plan_id.is_some()
        && plan.snapshot.is_some()
        && plan.pack_ref.is_some()
        && plan.pack_hash.is_some()
        && plan.policy_versions.is_some()
        && plan.scope_allow_list_ref.is_some()
        && plan.strategy.is_some()
        && plan.evidence_policy.is_some()
        && plan.schema_version.is_some();
    if !complete {
        codes.push(DenyCode::PlanMissingRequiredFields);
    }
    // A stale pack hash means the plan was authored against a different
    // scope.
    if let Some(hash) = &plan.pack_hash
        && hash != &pack.hash
    {
        codes.push(DenyCode::PlanScopeViolation);
    }
}

fn check_structure(plan: &PlanDocument, codes: &mut Vec<DenyCode>) {
    let mut ids = HashSet::new();
    let mut duplicate = false;
    for node in &plan.nodes {
        if !ids.insert(node.id.as_str()) {
            duplicate = true;
        }
    }
    let unresolved = plan
        .nodes
        .iter()
        .flat_map(|n| n.depends_on.iter())
        .any(|dep| !ids.contains(dep.as_str()));

    if duplicate || unresolved || has_cycle(&plan.nodes) {
        codes.push(DenyCode::PlanNotAtomic);
        // Downstream mapping checks would only produce noise on a broken
        // graph.
        return;
    }

    // Every change node needs at least one validate node mapping to it.
    for node in &plan.nodes {
        if node.kind != PlanNodeKind::Change {
            continue;
        }
        let mapped = plan
            .nodes
            .iter()
            .any(|v| v.kind == PlanNodeKind::Validate && v.maps_to.contains(&node.id));
        if !mapped {
            codes.push(DenyCode::PlanNotAtomic);
            break;
        }
    }

    // Every side_effect must depend, transitively, on a validate node.
    let by_id: HashMap<&str, &PlanNode> =
        plan.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    for node in &plan.nodes {
        if node.kind != PlanNodeKind::SideEffect {
            continue;
        }
        if !depends_on_validate(node, &by_id) {
            codes.push(DenyCode::ExecUngatedSideEffect);
            break;
        }
    }
}

fn has_cycle(nodes: &[PlanNode]) -> bool {
    // Kahn's algorithm over dependency edges.
    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for node in nodes {
        for dep in &node.depends_on {
            if in_degree.contains_key(dep.as_str()) {
                *in_degree.entry(node.id.as_str()).or_default() += 1;
            }
        }
    }
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop() {
        visited += 1;
        for node in nodes {
            if node.depends_on.iter().any(|d| d == id) {
                let degree = in_degree.entry(node.id.as_str()).or_default();
                *degree -= 1;
                if *degree == 0 {
                    queue.push(node.id.as_str());
                }
            }
        }
    }
    visited != nodes.len()
}

fn depends_on_validate(node: &PlanNode, by_id: &HashMap<&str, &PlanNode>) -> bool {
    let mut stack: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(dep) = by_id.get(id) else { continue };
        if dep.kind == PlanNodeKind::Validate {
            return true;
        }
        stack.extend(dep.depends_on.iter().map(String::as_str));
    }
    false
}

fn check_kind_fields(plan: &PlanDocument, codes: &mut Vec<DenyCode>) {
    for node in &plan.nodes {
        match node.kind {
            PlanNodeKind::Change => {
                if node.target_file.is_none() {
                    codes.push(DenyCode::PlanMissingRequiredFields);
                }
            }
            PlanNodeKind::Validate => {
                if node.maps_to.is_empty() || node.command.is_none() {
                    codes.push(DenyCode::PlanMissingRequiredFields);
                }
            }
            PlanNodeKind::SideEffect => {
                if node.effect.is_none() {
                    codes.push(DenyCode::PlanMissingRequiredFields);
                }
                // A side effect with no gate can never be executed safely.
                if node.commit_gate_id.is_none() {
                    codes.push(DenyCode::ExecUngatedSideEffect);
                }
            }
            PlanNodeKind::Escalate => {
                if node.need.is_none() {
                    codes.push(DenyCode::PlanMissingRequiredFields);
                }
            }
        }
    }
}

/// Normalize a path without touching the filesystem, resolving `.` and
/// `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn target_within_roots(target: &str, worktree_root: &Path, scratch_root: &Path) -> bool {
    let path = Path::new(target);
    let abs = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&worktree_root.join(path))
    };
    abs.starts_with(normalize(worktree_root)) || abs.starts_with(normalize(scratch_root))
}

fn check_scope(
    plan: &PlanDocument,
    pack: &ContextPack,
    worktree_root: &Path,
    scratch_root: &Path,
    codes: &mut Vec<DenyCode>,
) {
    for node in &plan.nodes {
        if let Some(target) = &node.target_file {
            if !target_within_roots(target, worktree_root, scratch_root)
                || !pack.files.contains(target)
            {
                codes.push(DenyCode::PlanScopeViolation);
            }
        }
        // Wildcard symbols would make the reservation scope unbounded.
        if node
            .target_symbols
            .iter()
            .any(|s| s.contains('*') || s.contains('?'))
        {
            codes.push(DenyCode::PlanScopeViolation);
        }
    }
}

fn check_evidence(plan: &PlanDocument, pack: &ContextPack, codes: &mut Vec<DenyCode>) {
    let Some(strategy) = &plan.strategy else {
        // Already reported as envelope incompleteness.
        return;
    };

    let mut sources: HashMap<EvidenceCategory, HashSet<&str>> = HashMap::new();
    for reason in &strategy.reasons {
        for evidence in &reason.evidence {
            sources
                .entry(evidence.category)
                .or_default()
                // Two references to the same file count as one source.
                .insert(evidence.source.as_str());
        }
    }

    let policy = &pack.plan_graph_schema.evidence_policy;
    let guard_set = plan
        .evidence_policy
        .as_ref()
        .and_then(|p| p.single_source.as_ref())
        .is_some();

    for (category, min) in [
        (EvidenceCategory::Requirement, policy.requirement_min),
        (EvidenceCategory::Code, policy.code_min),
        (EvidenceCategory::Policy, policy.policy_min),
    ] {
        let distinct = sources.get(&category).map_or(0, HashSet::len) as u32;
        if distinct >= min {
            continue;
        }
        // The single-source path is permitted only when the guard fields
        // are set and there is at least one source.
        if guard_set && distinct >= 1 {
            continue;
        }
        codes.push(DenyCode::PlanEvidenceInsufficient);
    }
}

fn check_strategy(plan: &PlanDocument, pack: &ContextPack, codes: &mut Vec<DenyCode>) {
    let Some(strategy) = &plan.strategy else {
        return;
    };
    if strategy.id != pack.strategy_id {
        codes.push(DenyCode::PlanStrategyMismatch);
    }
    if strategy.reasons.is_empty() || strategy.reasons.iter().any(|r| r.evidence.is_empty()) {
        codes.push(DenyCode::PlanStrategyMismatch);
    }
}

fn check_citations(plan: &PlanDocument, pack: &ContextPack, codes: &mut Vec<DenyCode>) {
    for node in &plan.nodes {
        for citation in &node.citations {
            if !citation.starts_with("codemod:") {
                continue;
            }
            match parse_codemod_citation(citation) {
                Some((id, cited_version)) => {
                    if !is_registered_codemod(id) {
                        codes.push(DenyCode::PlanPolicyViolation);
                    } else if let Some(version) = cited_version
                        && lookup_codemod(id).is_some_and(|c| c.version != version)
                    {
                        codes.push(DenyCode::PlanPolicyViolation);
                    }
                }
                None => codes.push(DenyCode::PlanPolicyViolation),
            }
        }
    }

    // Citation tokens the pack schema demands must appear somewhere.
    for required in &pack.plan_graph_schema.required_citations {
        let cited = plan
            .nodes
            .iter()
            .any(|n| n.citations.iter().any(|c| c == required));
        if !cited {
            codes.push(DenyCode::PlanPolicyViolation);
        }
    }
}

fn check_attachment_linkage(plan: &PlanDocument, codes: &mut Vec<DenyCode>) {
    for node in &plan.nodes {
        if node.kind != PlanNodeKind::Change {
            continue;
        }
        for citation in &node.citations {
            if citation.starts_with("attachment:") && !node.artifact_refs.contains(citation) {
                codes.push(DenyCode::PlanMissingArtifactRef);
            }
        }
    }
}
