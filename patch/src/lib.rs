//! Structured patch engine: the two mutation operations the controller
//! accepts (`replace_text` and `ast_codemod`), applied in memory so the
//! caller decides when bytes hit disk.

mod codemods;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use similar::TextDiff;
use thiserror::Error;

pub use codemods::Codemod;
pub use codemods::is_registered_codemod;
pub use codemods::lookup_codemod;
pub use codemods::parse_codemod_citation;
pub use codemods::registered_codemods;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unknown codemod: {0}")]
    UnknownCodemod(String),

    #[error("codemod {codemod}: missing parameter `{param}`")]
    MissingParam { codemod: String, param: String },

    #[error("codemod {codemod}: parameter `{param}` is not a valid identifier: {value}")]
    InvalidIdentifier {
        codemod: String,
        param: String,
        value: String,
    },

    #[error("replace_text: `find` must be non-empty")]
    EmptyFind,
}

/// One structured patch operation, as submitted in `apply_code_patch`
/// args. The wire tag matches the verb's `operation` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PatchOp {
    ReplaceText {
        find: String,
        replace: String,
    },
    AstCodemod {
        codemod_id: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl PatchOp {
    /// The codemod id, when this op is one.
    pub fn codemod_id(&self) -> Option<&str> {
        match self {
            PatchOp::AstCodemod { codemod_id, .. } => Some(codemod_id),
            PatchOp::ReplaceText { .. } => None,
        }
    }
}

/// Counts recorded in `diff.summary.json` for every applied patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub changed: bool,
    pub replacements: usize,
    pub line_delta: i64,
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub new_content: String,
    pub summary: DiffSummary,
    /// Unified diff of the change, persisted alongside the summary.
    pub unified_diff: String,
}

/// Apply `op` to `content` and report what changed. Never touches disk.
pub fn apply_patch_op(content: &str, op: &PatchOp) -> Result<PatchOutcome, PatchError> {
    let (new_content, replacements) = match op {
        PatchOp::ReplaceText { find, replace } => {
            if find.is_empty() {
                return Err(PatchError::EmptyFind);
            }
            let count = content.matches(find.as_str()).count();
            (content.replace(find.as_str(), replace), count)
        }
        PatchOp::AstCodemod { codemod_id, params } => {
            let codemod = lookup_codemod(codemod_id)
                .ok_or_else(|| PatchError::UnknownCodemod(codemod_id.clone()))?;
            codemod.apply(content, params)?
        }
    };

    let summary = DiffSummary {
        changed: replacements > 0,
        replacements,
        line_delta: new_content.lines().count() as i64 - content.lines().count() as i64,
    };
    let unified_diff = if summary.changed {
        TextDiff::from_lines(content, &new_content)
            .unified_diff()
            .context_radius(2)
            .to_string()
    } else {
        String::new()
    };

    Ok(PatchOutcome {
        new_content,
        summary,
        unified_diff,
    })
}
