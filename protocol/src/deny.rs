use serde::Deserialize;
use serde::Serialize;

/// Coded deny reasons. These are data carried in the response envelope,
/// never surfaced as Rust errors. Codes belong to the `PLAN_`, `EXEC_` and
/// `PACK_` families, plus the budget gate code; memory and graph rules may
/// configure their own code as long as it stays inside one of the three
/// families.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DenyCode {
    PlanMissingRequiredFields,
    PlanNotAtomic,
    PlanScopeViolation,
    PlanEvidenceInsufficient,
    PlanStrategyMismatch,
    PlanPolicyViolation,
    PlanMissingArtifactRef,
    PlanVerificationWeak,
    /// The requested verb is not in the capability set for the current
    /// state, or is unknown entirely.
    PlanCapabilityScope,
    ExecSideEffectCollision,
    ExecUngatedSideEffect,
    PackInsufficient,
    PackScopeViolation,
    BudgetThresholdExceeded,
    /// A rule-configured code from an enforcement-bundle entry. Constrained
    /// at parse time to the `PLAN_`/`EXEC_`/`PACK_` families.
    Rule(String),
}

impl DenyCode {
    pub fn as_str(&self) -> &str {
        match self {
            DenyCode::PlanMissingRequiredFields => "PLAN_MISSING_REQUIRED_FIELDS",
            DenyCode::PlanNotAtomic => "PLAN_NOT_ATOMIC",
            DenyCode::PlanScopeViolation => "PLAN_SCOPE_VIOLATION",
            DenyCode::PlanEvidenceInsufficient => "PLAN_EVIDENCE_INSUFFICIENT",
            DenyCode::PlanStrategyMismatch => "PLAN_STRATEGY_MISMATCH",
            DenyCode::PlanPolicyViolation => "PLAN_POLICY_VIOLATION",
            DenyCode::PlanMissingArtifactRef => "PLAN_MISSING_ARTIFACT_REF",
            DenyCode::PlanVerificationWeak => "PLAN_VERIFICATION_WEAK",
            DenyCode::PlanCapabilityScope => "PLAN_CAPABILITY_SCOPE",
            DenyCode::ExecSideEffectCollision => "EXEC_SIDE_EFFECT_COLLISION",
            DenyCode::ExecUngatedSideEffect => "EXEC_UNGATED_SIDE_EFFECT",
            DenyCode::PackInsufficient => "PACK_INSUFFICIENT",
            DenyCode::PackScopeViolation => "PACK_SCOPE_VIOLATION",
            DenyCode::BudgetThresholdExceeded => "BUDGET_THRESHOLD_EXCEEDED",
            DenyCode::Rule(code) => code,
        }
    }

    /// Whether `code` is acceptable as a rule-configured deny code.
    pub fn is_valid_rule_code(code: &str) -> bool {
        code.starts_with("PLAN_") || code.starts_with("EXEC_") || code.starts_with("PACK_")
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DenyCode> for String {
    fn from(code: DenyCode) -> Self {
        code.as_str().to_string()
    }
}

impl TryFrom<String> for DenyCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        let code = match value.as_str() {
            "PLAN_MISSING_REQUIRED_FIELDS" => DenyCode::PlanMissingRequiredFields,
            "PLAN_NOT_ATOMIC" => DenyCode::PlanNotAtomic,
            "PLAN_SCOPE_VIOLATION" => DenyCode::PlanScopeViolation,
            "PLAN_EVIDENCE_INSUFFICIENT" => DenyCode::PlanEvidenceInsufficient,
            "PLAN_STRATEGY_MISMATCH" => DenyCode::PlanStrategyMismatch,
            "PLAN_POLICY_VIOLATION" => DenyCode::PlanPolicyViolation,
            "PLAN_MISSING_ARTIFACT_REF" => DenyCode::PlanMissingArtifactRef,
            "PLAN_VERIFICATION_WEAK" => DenyCode::PlanVerificationWeak,
            "PLAN_CAPABILITY_SCOPE" => DenyCode::PlanCapabilityScope,
            "EXEC_SIDE_EFFECT_COLLISION" => DenyCode::ExecSideEffectCollision,
            "EXEC_UNGATED_SIDE_EFFECT" => DenyCode::ExecUngatedSideEffect,
            "PACK_INSUFFICIENT" => DenyCode::PackInsufficient,
            "PACK_SCOPE_VIOLATION" => DenyCode::PackScopeViolation,
            "BUDGET_THRESHOLD_EXCEEDED" => DenyCode::BudgetThresholdExceeded,
            other if Self::is_valid_rule_code(other) => DenyCode::Rule(value),
            other => return Err(format!("deny code outside known families: {other}")),
        };
        Ok(code)
    }
}
