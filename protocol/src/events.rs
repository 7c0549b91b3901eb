use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;

/// One append-only observability row. The event log is the authoritative
/// history; the in-memory session map is a rebuildable cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_session_id: String,
    pub work_id: String,
    pub agent_id: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    InputEnvelope,
    OutputEnvelope,
    RetrievalTrace,
    PendingCorrectionCreated,
    MemoryPromotionTransition,
    RecipeUsage,
    NodeBundleWritten,
    PromptMismatch,
    SubAgentJoined,
    PackEnriched,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_row_wire_shape() {
        let row = EventRecord {
            timestamp: "2025-06-01T00:00:00Z".into(),
            kind: EventKind::InputEnvelope,
            run_session_id: "rs".into(),
            work_id: "w".into(),
            agent_id: "a".into(),
            payload: serde_json::json!({"verb": "escalate"}),
        };
        let value = serde_json::to_value(&row).expect("serialize");
        assert_eq!(value["type"], "input_envelope");
        assert_eq!(value["runSessionId"], "rs");
    }
}
