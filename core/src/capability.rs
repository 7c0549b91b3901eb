//! The verb catalog: constant per-state allow-lists, the budget-safe set,
//! and the contract descriptors returned in every envelope.

use std::collections::BTreeMap;

use strum::IntoEnumIterator;
use warden_protocol::SessionState;
use warden_protocol::Verb;
use warden_protocol::VerbDescriptor;

use Verb::*;

const READ_VERBS: &[Verb] = &[
    ReadFileLines,
    LookupSymbolDefinition,
    TraceSymbolGraph,
    SearchCodebaseText,
];

const PLANNING_VERBS: &[Verb] = &[
    ReadFileLines,
    LookupSymbolDefinition,
    TraceSymbolGraph,
    SearchCodebaseText,
    WriteScratchFile,
    SubmitExecutionPlan,
    Escalate,
    SignalTaskComplete,
];

const PLAN_ACCEPTED_VERBS: &[Verb] = &[
    ReadFileLines,
    LookupSymbolDefinition,
    TraceSymbolGraph,
    SearchCodebaseText,
    WriteScratchFile,
    SubmitExecutionPlan,
    Escalate,
    SignalTaskComplete,
    ApplyCodePatch,
    RunSandboxedCode,
    ExecuteGatedSideEffect,
    RunAutomationRecipe,
];

const TERMINAL_VERBS: &[Verb] = &[SignalTaskComplete];

/// Verbs that stay permitted once the budget gate has tripped.
const BUDGET_SAFE_VERBS: &[Verb] = &[InitializeWork, Escalate, SignalTaskComplete];

pub fn allowed_verbs(state: SessionState) -> &'static [Verb] {
    match state {
        SessionState::Uninitialized => &[InitializeWork],
        SessionState::Planning => PLANNING_VERBS,
        SessionState::PlanAccepted => PLAN_ACCEPTED_VERBS,
        SessionState::Completed | SessionState::Failed => TERMINAL_VERBS,
        SessionState::BlockedBudget => BUDGET_SAFE_VERBS,
    }
}

pub fn is_permitted(state: SessionState, verb: Verb) -> bool {
    allowed_verbs(state).contains(&verb)
}

pub fn is_budget_safe(verb: Verb) -> bool {
    BUDGET_SAFE_VERBS.contains(&verb)
}

pub fn is_read_verb(verb: Verb) -> bool {
    READ_VERBS.contains(&verb)
}

pub fn capabilities_for(state: SessionState) -> Vec<String> {
    allowed_verbs(state).iter().map(Verb::to_string).collect()
}

pub fn verb_descriptor(verb: Verb) -> VerbDescriptor {
    let (description, when_to_use, required, optional): (&str, &str, &[&str], &[&str]) = match verb
    {
        InitializeWork => (
            "Create or join a work unit and build its sealed ContextPack.",
            "First turn of a session, or to re-anchor after BLOCKED_BUDGET.",
            &[],
            &["prompt"],
        ),
        ReadFileLines => (
            "Read a line range from a file inside the pack allow-list.",
            "Inspecting code the pack already covers.",
            &["file"],
            &["start", "end"],
        ),
        LookupSymbolDefinition => (
            "Resolve a symbol to its declaring file and kind.",
            "Locating a definition before planning a change.",
            &["name"],
            &[],
        ),
        TraceSymbolGraph => (
            "Walk graph edges outward from a symbol.",
            "Understanding callers/callees before scoping a change.",
            &["name"],
            &["depth"],
        ),
        SearchCodebaseText => (
            "Literal text search across pack files.",
            "Finding occurrences the symbol inventory does not index.",
            &["query"],
            &["limit"],
        ),
        WriteScratchFile => (
            "Write a file under the session scratch root.",
            "Drafting notes or fixtures without touching the repository.",
            &["path", "content"],
            &[],
        ),
        SubmitExecutionPlan => (
            "Submit the plan graph for validation against the enforcement bundle.",
            "Once evidence is gathered and the change set is decided.",
            &["plan"],
            &[],
        ),
        Escalate => (
            "Request pack enrichment with typed evidence needs.",
            "When the pack is insufficient for the work at hand.",
            &["need"],
            &["requestedEvidence"],
        ),
        SignalTaskComplete => (
            "Declare the work unit finished.",
            "After every plan node completed and validations passed.",
            &[],
            &["outcome"],
        ),
        ApplyCodePatch => (
            "Apply a structured patch (replace_text or ast_codemod) for a change node.",
            "Executing an accepted change node.",
            &["nodeId", "targetFile", "operation"],
            &["find", "replace", "codemodId", "params"],
        ),
        RunSandboxedCode => (
            "Run an async self-invoking expression in the sandboxed evaluator.",
            "Executing a validate node.",
            &["nodeId", "expression", "artifactOutput"],
            &["inputs", "timeoutMs", "memoryCapMb", "expectedShape"],
        ),
        ExecuteGatedSideEffect => (
            "Execute an approved external side effect behind its commit gate.",
            "Executing a side_effect node after its validations passed.",
            &["nodeId", "commitGateId"],
            &["payload"],
        ),
        RunAutomationRecipe => (
            "Run a registered automation recipe cited by a change node.",
            "Repetitive multi-file edits covered by a registered recipe.",
            &["nodeId", "recipeId"],
            &[],
        ),
    };
    VerbDescriptor {
        description: description.to_string(),
        when_to_use: when_to_use.to_string(),
        required_args: required.iter().map(|s| s.to_string()).collect(),
        optional_args: optional.iter().map(|s| s.to_string()).collect(),
    }
}

/// Full contract table keyed by wire verb name.
pub fn verb_descriptions() -> BTreeMap<String, VerbDescriptor> {
    Verb::iter()
        .map(|verb| (verb.to_string(), verb_descriptor(verb)))
        .collect()
}
