//! Wire contract shared by the Warden kernel and the MCP server: the
//! `controller_turn` request/response envelope, the verb and state
//! vocabulary, the closed deny-code set, plan-graph documents, and the
//! observability event rows.

pub mod deny;
pub mod envelope;
pub mod events;
pub mod plan;
pub mod verbs;

pub use deny::DenyCode;
pub use envelope::BudgetStatus;
pub use envelope::ContextSignature;
pub use envelope::KnowledgeStrategy;
pub use envelope::PackInsufficiency;
pub use envelope::ProgressSummary;
pub use envelope::ResponseEnvelope;
pub use envelope::ScopeInfo;
pub use envelope::SubAgentHints;
pub use envelope::TurnOutcome;
pub use envelope::VerbDescriptor;
pub use events::EventKind;
pub use events::EventRecord;
pub use plan::AtomicityBoundary;
pub use plan::EvidenceCategory;
pub use plan::EvidencePolicy;
pub use plan::EvidenceRef;
pub use plan::PlanDocument;
pub use plan::PlanNode;
pub use plan::PlanNodeKind;
pub use plan::PlanStrategy;
pub use plan::RequestedEvidence;
pub use plan::RequestedEvidenceKind;
pub use plan::SingleSourceGuard;
pub use plan::StrategyReason;
pub use verbs::SessionState;
pub use verbs::TurnRequest;
pub use verbs::Verb;

/// Version stamped into every response envelope.
pub const ENVELOPE_SCHEMA_VERSION: &str = "1";
