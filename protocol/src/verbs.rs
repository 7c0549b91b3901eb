use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;
use strum_macros::EnumIter;
use strum_macros::EnumString;

/// The verbs a `controller_turn` call may request. The wire spelling is
/// `snake_case`; verbs outside this set are denied with a capability scope
/// code rather than rejected at the parse layer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verb {
    InitializeWork,
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
}

/// Lifecycle state of a work-unit session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Uninitialized,
    Planning,
    PlanAccepted,
    Completed,
    Failed,
    BlockedBudget,
}

impl SessionState {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// The single `controller_turn` tool-call parameter. The verb is carried as
/// a plain string so an unknown verb still reaches the kernel and earns a
/// coded deny inside a well-formed envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Which controller operation to perform this turn (e.g.
    /// `initialize_work`, `submit_execution_plan`, `apply_code_patch`).
    pub verb: String,

    /// Verb-specific arguments; each verb documents its required and
    /// optional keys in the envelope's verb descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonValue>,

    /// The user prompt driving this work unit. Stored verbatim on the first
    /// non-empty occurrence and echoed in every later envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,

    /// Omit to mint a fresh run session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_session_id: Option<String>,

    /// Omit to mint a fresh work unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,

    /// Omit to join the work unit as a newly minted sub-agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Opaque caller-side correlation data, copied into the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_meta: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn verb_wire_spelling_is_snake_case() {
        let json = serde_json::to_string(&Verb::SubmitExecutionPlan).expect("serialize");
        assert_eq!(json, "\"submit_execution_plan\"");
        assert_eq!(
            Verb::from_str("apply_code_patch").expect("parse"),
            Verb::ApplyCodePatch
        );
    }

    #[test]
    fn unknown_verb_does_not_parse() {
        assert!(Verb::from_str("drop_database").is_err());
    }

    #[test]
    fn state_wire_spelling_is_screaming_snake_case() {
        let json = serde_json::to_string(&SessionState::PlanAccepted).expect("serialize");
        assert_eq!(json, "\"PLAN_ACCEPTED\"");
        assert_eq!(SessionState::BlockedBudget.to_string(), "BLOCKED_BUDGET");
    }

    #[test]
    fn turn_request_minimal_parse() {
        let req: TurnRequest =
            serde_json::from_str(r#"{"verb":"initialize_work"}"#).expect("parse");
        assert_eq!(req.verb, "initialize_work");
        assert!(req.work_id.is_none());
    }
}
